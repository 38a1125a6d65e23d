//! Static threshold policy, indexed by device type.
//!
//! The built-in table can be overridden per type (agent-wide `thresholds`
//! block) and per device. A metric breaches a level when `value >= bound`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::{DeviceType, Metrics, Severity};
use super::vocabulary::{
    CPU_USAGE, LATENCY_MS, MEMORY_USAGE, PACKET_LOSS, RESPONSE_TIME, STORAGE_USAGE, TEMPERATURE,
};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    pub fn validate(&self, key: &str) -> Result<(), ConfigError> {
        if !self.warning.is_finite() || !self.critical.is_finite() {
            return Err(ConfigError::InvalidThreshold {
                key: key.to_string(),
                reason: "bounds must be finite numbers".into(),
            });
        }
        if self.warning > self.critical {
            return Err(ConfigError::InvalidThreshold {
                key: key.to_string(),
                reason: format!(
                    "warning ({}) is above critical ({})",
                    self.warning, self.critical
                ),
            });
        }
        Ok(())
    }

    /// Severity reached by `value`, if any.
    pub fn level(&self, value: f64) -> Option<Severity> {
        if value >= self.critical {
            Some(Severity::Critical)
        } else if value >= self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }
}

/// A single metric over its bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breach {
    pub key: String,
    pub value: f64,
    pub bound: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub breaches: Vec<Breach>,
}

impl Evaluation {
    pub fn worst(&self) -> Option<Severity> {
        self.breaches.iter().map(|b| b.severity).max()
    }

    /// `cpu_usage=95 (>= 90)` style summary of breaches at `severity`.
    pub fn describe(&self, severity: Severity) -> String {
        self.breaches
            .iter()
            .filter(|b| b.severity == severity)
            .map(|b| format!("{}={} (>= {})", b.key, b.value, b.bound))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdPolicy {
    entries: HashMap<String, Threshold>,
}

impl ThresholdPolicy {
    /// Built-in policy for a device type.
    pub fn for_type(device_type: DeviceType) -> Self {
        let mut entries: HashMap<String, Threshold> = [
            (CPU_USAGE, Threshold::new(70.0, 90.0)),
            (MEMORY_USAGE, Threshold::new(75.0, 90.0)),
            (LATENCY_MS, Threshold::new(2000.0, 5000.0)),
            (RESPONSE_TIME, Threshold::new(2000.0, 5000.0)),
            (PACKET_LOSS, Threshold::new(20.0, 50.0)),
            (TEMPERATURE, Threshold::new(70.0, 85.0)),
        ]
        .into_iter()
        .map(|(k, t)| (k.to_string(), t))
        .collect();

        let extras: &[(&str, Threshold)] = match device_type {
            DeviceType::Switch => &[
                ("broadcast_storms", Threshold::new(10.0, 50.0)),
                ("error_packets", Threshold::new(100.0, 1000.0)),
            ],
            DeviceType::Router => &[("routing_table_changes", Threshold::new(50.0, 200.0))],
            DeviceType::Nas => &[(STORAGE_USAGE, Threshold::new(80.0, 95.0))],
            DeviceType::Firewall | DeviceType::IdsIps => {
                &[("threat_detection", Threshold::new(100.0, 500.0))]
            }
            _ => &[],
        };
        for (key, threshold) in extras {
            entries.insert((*key).to_string(), *threshold);
        }

        Self { entries }
    }

    /// Replace or add entries. Later overrides win.
    pub fn with_overrides(mut self, overrides: &HashMap<String, Threshold>) -> Self {
        for (key, threshold) in overrides {
            self.entries.insert(key.clone(), *threshold);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Threshold> {
        self.entries.get(key)
    }

    /// Check every metric that has a threshold. Breaches come back sorted by
    /// key so alert messages are stable.
    pub fn evaluate(&self, metrics: &Metrics) -> Evaluation {
        let mut breaches: Vec<Breach> = metrics
            .iter()
            .filter_map(|(key, &value)| {
                let threshold = self.entries.get(key)?;
                let severity = threshold.level(value)?;
                let bound = match severity {
                    Severity::Critical => threshold.critical,
                    _ => threshold.warning,
                };
                Some(Breach {
                    key: key.clone(),
                    value,
                    bound,
                    severity,
                })
            })
            .collect();
        breaches.sort_by(|a, b| a.key.cmp(&b.key));
        Evaluation { breaches }
    }
}
