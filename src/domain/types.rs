use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProbeError};

/// String-keyed numeric metrics. Keys follow the vocabulary in
/// `domain::vocabulary`; iteration order is unspecified.
pub type Metrics = HashMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Router,
    Switch,
    Firewall,
    WirelessAp,
    LoadBalancer,
    Gateway,
    ProxyServer,
    Modem,
    IdsIps,
    VoipGateway,
    Repeater,
    Bridge,
    Nas,
    VpnConcentrator,
}

impl DeviceType {
    pub const ALL: [DeviceType; 14] = [
        DeviceType::Router,
        DeviceType::Switch,
        DeviceType::Firewall,
        DeviceType::WirelessAp,
        DeviceType::LoadBalancer,
        DeviceType::Gateway,
        DeviceType::ProxyServer,
        DeviceType::Modem,
        DeviceType::IdsIps,
        DeviceType::VoipGateway,
        DeviceType::Repeater,
        DeviceType::Bridge,
        DeviceType::Nas,
        DeviceType::VpnConcentrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Router => "router",
            DeviceType::Switch => "switch",
            DeviceType::Firewall => "firewall",
            DeviceType::WirelessAp => "wireless_ap",
            DeviceType::LoadBalancer => "load_balancer",
            DeviceType::Gateway => "gateway",
            DeviceType::ProxyServer => "proxy_server",
            DeviceType::Modem => "modem",
            DeviceType::IdsIps => "ids_ips",
            DeviceType::VoipGateway => "voip_gateway",
            DeviceType::Repeater => "repeater",
            DeviceType::Bridge => "bridge",
            DeviceType::Nas => "nas",
            DeviceType::VpnConcentrator => "vpn_concentrator",
        }
    }
}

impl FromStr for DeviceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownDeviceType(s.to_string()))
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Monitoring protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Ping,
    Snmp,
    Http,
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(Method::Ping),
            "snmp" => Ok(Method::Snmp),
            "http" => Ok(Method::Http),
            _ => Err(ConfigError::UnknownMethod(s.trim().to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Ping => write!(f, "ping"),
            Method::Snmp => write!(f, "snmp"),
            Method::Http => write!(f, "http"),
        }
    }
}

/// Device status classification maintained by the status engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Warning,
    Critical,
    Offline,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Online => write!(f, "online"),
            Status::Warning => write!(f, "warning"),
            Status::Critical => write!(f, "critical"),
            Status::Offline => write!(f, "offline"),
        }
    }
}

/// Outcome of one poll cycle for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub metrics: Metrics,
    pub probe_errors: Vec<ProbeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    StatusTransition,
    ThresholdBreach,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Emitted by the status engine on a state transition. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub device_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
