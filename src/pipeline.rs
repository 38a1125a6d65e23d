//! Single consumer of poll results: feeds the status engine and hands one
//! `SyncRecord` per cycle to the sync worker.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::domain::device::DeviceConfig;
use crate::domain::scoring::RiskLevel;
use crate::domain::status_engine::{Observation, StatusEngine};
use crate::domain::types::{PollResult, Severity};
use crate::sync::SyncRecord;

pub struct Pipeline {
    engine: StatusEngine,
    devices: HashMap<String, Arc<DeviceConfig>>,
    sync: mpsc::Sender<SyncRecord>,
}

impl Pipeline {
    pub fn new(devices: impl IntoIterator<Item = Arc<DeviceConfig>>, sync: mpsc::Sender<SyncRecord>) -> Self {
        Self {
            engine: StatusEngine::new(),
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            sync,
        }
    }

    #[cfg(test)]
    pub fn engine(&self) -> &StatusEngine {
        &self.engine
    }

    /// Apply one result and queue the resulting update. Results for devices
    /// that are not registered here are ignored.
    pub fn process(&mut self, result: PollResult) -> Option<Observation> {
        let Some(device) = self.devices.get(&result.device_id).cloned() else {
            warn!(device_id = %result.device_id, "result for unknown device ignored");
            return None;
        };

        let observation = self.engine.observe(&result, &device.thresholds, Utc::now());

        info!(
            device_id = %device.id,
            status = %observation.current,
            reachable = result.reachable,
            latency_ms = result.latency_ms,
            metrics = result.metrics.len(),
            score = observation.score,
            probe_errors = result.probe_errors.len(),
            "poll cycle"
        );
        if observation.transitioned && observation.alerts.is_empty() {
            info!(device_id = %device.id, status = %observation.current, "device discovered");
        } else if observation.transitioned {
            info!(
                device_id = %device.id,
                from = %observation.previous,
                to = %observation.current,
                "status changed"
            );
        }
        for alert in &observation.alerts {
            match alert.severity {
                Severity::Info => info!(device_id = %alert.device_id, kind = ?alert.kind, "{}", alert.message),
                _ => warn!(
                    device_id = %alert.device_id,
                    kind = ?alert.kind,
                    severity = %alert.severity,
                    "{}",
                    alert.message
                ),
            }
        }

        let alerts = self.engine.take_pending(&device.id);
        let last_seen = self.engine.state(&device.id).and_then(|s| s.last_seen);
        let record = SyncRecord {
            device: device.clone(),
            result,
            status: observation.current,
            score: observation.score,
            risk: RiskLevel::from_score(observation.score),
            last_seen,
            alerts,
        };

        if let Err(e) = self.sync.try_send(record) {
            let (reason, record) = match e {
                TrySendError::Full(record) => ("sync queue full", record),
                TrySendError::Closed(record) => ("sync worker gone", record),
            };
            warn!(
                device_id = %device.id,
                pending_alerts = record.alerts.len(),
                reason,
                "dropping device update"
            );
            self.engine.restore_pending(&device.id, record.alerts);
        }

        Some(observation)
    }

    /// Consume results until every scheduler sender is dropped.
    pub async fn run(mut self, mut results: mpsc::Receiver<PollResult>) {
        while let Some(result) = results.recv().await {
            self.process(result);
        }
        debug!("pipeline stopped");
    }
}
