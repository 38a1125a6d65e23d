//! Per-device status state machine.
//!
//! The engine is the only writer of `DeviceState`. Results for one device
//! must be fed in the order they were produced; the pipeline task guarantees
//! that by being the single consumer of the scheduler's result channel.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::scoring;
use super::thresholds::{Evaluation, ThresholdPolicy};
use super::types::{AlertEvent, AlertKind, PollResult, Severity, Status};

/// Consecutive unreachable results needed before a device is declared offline.
pub const DEBOUNCE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct DeviceState {
    pub status: Status,
    /// False while the initial `offline` is only an assumption: the device
    /// has been neither seen reachable nor confirmed down.
    pub confirmed: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_score: u8,
    pub pending_alerts: VecDeque<AlertEvent>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            status: Status::Offline,
            confirmed: false,
            last_seen: None,
            consecutive_failures: 0,
            last_score: scoring::base_score(Status::Offline) as u8,
            pending_alerts: VecDeque::new(),
        }
    }
}

/// What a single result did to a device.
#[derive(Debug, Clone)]
pub struct Observation {
    pub previous: Status,
    pub current: Status,
    pub alerts: Vec<AlertEvent>,
    pub score: u8,
    pub transitioned: bool,
    pub evaluation: Evaluation,
}

#[derive(Debug, Default)]
pub struct StatusEngine {
    states: HashMap<String, DeviceState>,
}

impl StatusEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, device_id: &str) -> Option<&DeviceState> {
        self.states.get(device_id)
    }

    /// Apply one poll result. New alerts are returned and also queued in
    /// the device's `pending_alerts` until the sync layer takes them.
    pub fn observe(
        &mut self,
        result: &PollResult,
        policy: &ThresholdPolicy,
        now: DateTime<Utc>,
    ) -> Observation {
        let state = self
            .states
            .entry(result.device_id.clone())
            .or_insert_with(DeviceState::new);

        let previous = state.status;
        let was_confirmed = state.confirmed;

        let (current, evaluation) = if result.reachable {
            state.consecutive_failures = 0;
            state.last_seen = Some(result.timestamp);
            let evaluation = policy.evaluate(&result.metrics);
            let status = match evaluation.worst() {
                Some(Severity::Critical) => Status::Critical,
                Some(Severity::Warning) => Status::Warning,
                _ => Status::Online,
            };
            (status, evaluation)
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let status = if state.consecutive_failures >= DEBOUNCE_FAILURES {
                Status::Offline
            } else {
                previous
            };
            (status, Evaluation::default())
        };

        let newly_confirmed_offline = current == Status::Offline
            && !was_confirmed
            && state.consecutive_failures >= DEBOUNCE_FAILURES;
        let transitioned = current != previous || newly_confirmed_offline;

        let mut alerts = Vec::new();
        if transitioned {
            let alert = |kind, severity, message: String| AlertEvent {
                device_id: result.device_id.clone(),
                kind,
                severity,
                message,
                timestamp: now,
            };
            match current {
                Status::Offline => alerts.push(alert(
                    AlertKind::StatusTransition,
                    Severity::Critical,
                    format!(
                        "device {} is offline after {} consecutive failed polls",
                        result.device_id, state.consecutive_failures
                    ),
                )),
                Status::Critical => alerts.push(alert(
                    AlertKind::StatusTransition,
                    Severity::Critical,
                    format!(
                        "device {} changed from {} to critical: {}",
                        result.device_id,
                        previous,
                        evaluation.describe(Severity::Critical)
                    ),
                )),
                Status::Warning => alerts.push(alert(
                    AlertKind::ThresholdBreach,
                    Severity::Warning,
                    format!(
                        "device {} warning threshold breached: {}",
                        result.device_id,
                        evaluation.describe(Severity::Warning)
                    ),
                )),
                Status::Online if was_confirmed => alerts.push(alert(
                    AlertKind::Recovery,
                    Severity::Info,
                    format!("device {} recovered from {}", result.device_id, previous),
                )),
                // First sighting of a device that was never confirmed down.
                Status::Online => {}
            }
        }

        if result.reachable || newly_confirmed_offline {
            state.confirmed = true;
        }

        let score = scoring::score(current, &result.metrics);
        state.status = current;
        state.last_score = score;
        state.pending_alerts.extend(alerts.iter().cloned());

        Observation {
            previous,
            current,
            alerts,
            score,
            transitioned,
            evaluation,
        }
    }

    /// Hand every queued alert for a device to the caller.
    pub fn take_pending(&mut self, device_id: &str) -> Vec<AlertEvent> {
        self.states
            .get_mut(device_id)
            .map(|s| s.pending_alerts.drain(..).collect())
            .unwrap_or_default()
    }

    /// Put alerts back at the front of the queue, preserving their order,
    /// after a failed hand-off.
    pub fn restore_pending(&mut self, device_id: &str, alerts: Vec<AlertEvent>) {
        if let Some(state) = self.states.get_mut(device_id) {
            for alert in alerts.into_iter().rev() {
                state.pending_alerts.push_front(alert);
            }
        }
    }
}
