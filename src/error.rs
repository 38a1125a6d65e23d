//! Error taxonomy for the monitoring path.
//!
//! Probe and sync errors are recoverable and never terminate the agent:
//! probe failures are folded into `PollResult::probe_errors`, sync failures
//! are retried and then dropped. `ConfigError` rejects a single device entry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::types::{DeviceType, Method};

/// Why a single protocol probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    Timeout,
    Unreachable,
    Auth,
    BadResponse,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timeout"),
            ProbeFailure::Unreachable => write!(f, "unreachable"),
            ProbeFailure::Auth => write!(f, "auth"),
            ProbeFailure::BadResponse => write!(f, "bad_response"),
        }
    }
}

/// One failed method within a poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{method} probe failed ({reason}): {detail}")]
pub struct ProbeError {
    pub method: Method,
    pub reason: ProbeFailure,
    pub detail: String,
}

impl ProbeError {
    pub fn new(method: Method, reason: ProbeFailure, detail: impl Into<String>) -> Self {
        Self {
            method,
            reason,
            detail: detail.into(),
        }
    }

    pub fn timeout(method: Method, after: std::time::Duration) -> Self {
        Self::new(
            method,
            ProbeFailure::Timeout,
            format!("no answer within {}ms", after.as_millis()),
        )
    }
}

/// Failure delivering an update to the remote API.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The token was refused again right after a fresh login.
    #[error("authentication expired and re-login did not help")]
    AuthExpired,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Non-401 client error. Not retried.
    #[error("request rejected: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("could not decode API response: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },
}

impl SyncError {
    /// Network failures and 5xx answers are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::ServerError { .. })
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// A device entry that cannot be registered. Only that device is skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("device is enabled but has no monitoring methods")]
    EmptyMethods,

    #[error("unknown monitoring method '{0}' (expected ping, snmp or http)")]
    UnknownMethod(String),

    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("poll interval must be a number of seconds, at least 1")]
    InvalidInterval,

    #[error("timeout must be a number of seconds greater than zero")]
    ZeroTimeout,

    #[error("timeout ({timeout_secs}s) must be shorter than the poll interval ({interval_secs}s)")]
    TimeoutNotBelowInterval { timeout_secs: f64, interval_secs: f64 },

    #[error("unsupported SNMP version '{0}' (supported: 1, 2c)")]
    UnsupportedSnmpVersion(String),

    #[error("invalid HTTP endpoint '{0}'")]
    InvalidHttpEndpoint(String),

    #[error("unsupported HTTP method '{0}' (expected GET or POST)")]
    UnsupportedHttpMethod(String),

    #[error("HTTP basic auth and bearer token are mutually exclusive")]
    ConflictingHttpAuth,

    #[error("metric '{key}' is not part of the {device_type} vocabulary")]
    UnknownMetric { key: String, device_type: DeviceType },

    #[error("invalid threshold for '{key}': {reason}")]
    InvalidThreshold { key: String, reason: String },

    /// The entry could not be read into a device block at all.
    #[error("malformed device entry: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SyncError::Network("reset".into()).is_transient());
        assert!(SyncError::ServerError { status: 503 }.is_transient());
        assert!(!SyncError::AuthExpired.is_transient());
        assert!(!SyncError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn probe_error_display_names_method_and_reason() {
        let err = ProbeError::new(Method::Snmp, ProbeFailure::Auth, "bad community");
        assert_eq!(err.to_string(), "snmp probe failed (auth): bad community");
    }

    #[test]
    fn probe_failure_serializes_snake_case() {
        let json = serde_json::to_string(&ProbeFailure::BadResponse).unwrap();
        assert_eq!(json, "\"bad_response\"");
    }
}
