//! One timer task per device, feeding a shared bounded probe pool.
//!
//! A device task runs its cycles back to back and sends each result before
//! waiting for the next tick, so results for one device arrive in order.
//! Devices never wait on each other except for pool permits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::device::DeviceConfig;
use crate::domain::types::PollResult;
use crate::probe::Prober;
use crate::shutdown;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("device {0} is disabled")]
    Disabled(String),
    #[error("device {0} has no monitoring methods")]
    NoMethods(String),
    #[error("device {0} is already scheduled")]
    AlreadyScheduled(String),
}

struct DeviceTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    prober: Prober,
    pool: Arc<Semaphore>,
    results: mpsc::Sender<PollResult>,
    shutdown: CancellationToken,
    tasks: HashMap<String, DeviceTask>,
    /// Cancelled tasks that may still be finishing a cycle.
    draining: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        prober: Prober,
        pool_size: usize,
        results: mpsc::Sender<PollResult>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            prober,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            results,
            shutdown,
            tasks: HashMap::new(),
            draining: Vec::new(),
        }
    }

    /// Start polling `device` at its interval. The first cycle runs at once.
    pub fn schedule(&mut self, device: Arc<DeviceConfig>) -> Result<(), ScheduleError> {
        if !device.enabled {
            return Err(ScheduleError::Disabled(device.id.clone()));
        }
        if device.methods.is_empty() {
            return Err(ScheduleError::NoMethods(device.id.clone()));
        }
        if self.tasks.contains_key(&device.id) {
            return Err(ScheduleError::AlreadyScheduled(device.id.clone()));
        }

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(run_device(
            device.clone(),
            self.prober.clone(),
            self.pool.clone(),
            self.results.clone(),
            token.clone(),
        ));

        info!(
            device_id = %device.id,
            methods = %device.methods_label(),
            interval_secs = device.poll_interval.as_secs_f64(),
            timeout_secs = device.timeout.as_secs_f64(),
            "device scheduled"
        );
        self.tasks.insert(device.id.clone(), DeviceTask { token, handle });
        Ok(())
    }

    /// Stop polling a device. Returns false if it was not scheduled.
    pub fn cancel(&mut self, device_id: &str) -> bool {
        match self.tasks.remove(device_id) {
            Some(task) => {
                task.token.cancel();
                self.draining.push(task.handle);
                info!(device_id, "device unscheduled");
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every timer and give in-flight cycles up to `grace` to finish.
    pub async fn shutdown(mut self, grace: Duration) {
        let mut handles = std::mem::take(&mut self.draining);
        for (_, task) in self.tasks.drain() {
            task.token.cancel();
            handles.push(task.handle);
        }
        let total = handles.len();
        let aborted = shutdown::join_with_grace(handles, grace).await;
        info!(devices = total, aborted, "scheduler stopped");
    }
}

async fn run_device(
    device: Arc<DeviceConfig>,
    prober: Prober,
    pool: Arc<Semaphore>,
    results: mpsc::Sender<PollResult>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(device.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(result) = prober.poll(&device, &pool, &token).await else {
            break;
        };
        debug!(
            device_id = %device.id,
            reachable = result.reachable,
            errors = result.probe_errors.len(),
            "poll cycle finished"
        );
        if results.send(result).await.is_err() {
            // Nobody is consuming results any more.
            break;
        }
    }
    debug!(device_id = %device.id, "device task stopped");
}
