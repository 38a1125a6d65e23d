//! Validated, read-only device configuration.
//!
//! Built once by `config::load` and shared behind an `Arc` with the
//! scheduler, probes and pipeline.

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

use super::thresholds::ThresholdPolicy;
use super::types::{DeviceType, Method};

#[derive(Debug)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub location: String,
    pub address: String,
    /// Ordered, deduplicated. Order decides merge precedence.
    pub methods: Vec<Method>,
    pub snmp: SnmpSettings,
    pub http: HttpSettings,
    pub ping_count: u32,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub enabled: bool,
    pub thresholds: ThresholdPolicy,
}

impl DeviceConfig {
    /// `ping,snmp` style listing.
    pub fn methods_label(&self) -> String {
        self.methods
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
}

impl SnmpVersion {
    /// Value of the version field in the message header.
    pub fn wire_value(&self) -> i64 {
        match self {
            SnmpVersion::V1 => 0,
            SnmpVersion::V2c => 1,
        }
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnmpVersion::V1 => write!(f, "1"),
            SnmpVersion::V2c => write!(f, "2c"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnmpSettings {
    pub community: String,
    pub port: u16,
    pub version: SnmpVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug)]
pub enum HttpAuth {
    Basic {
        username: String,
        password: Option<SecretString>,
    },
    Bearer(SecretString),
}

#[derive(Debug)]
pub struct HttpSettings {
    pub endpoint: String,
    pub method: HttpMethod,
    pub auth: Option<HttpAuth>,
    /// Extra `(json path, metric key)` pairs, applied after the built-in mapping.
    pub fields: Vec<(String, String)>,
}
