//! `devwatch run`: the monitoring agent.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, LoadedConfig};
use crate::domain::device::DeviceConfig;
use crate::domain::vocabulary::VOCABULARY_VERSION;
use crate::logging::{self, LogFormat};
use crate::pipeline::Pipeline;
use crate::probe::Prober;
use crate::scheduler::{ScheduleError, Scheduler};
use crate::shutdown;
use crate::sync::{ApiClient, SyncWorker};

pub fn run(
    config_path: Option<String>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
) -> Result<()> {
    let loaded = config::load(config_path.as_deref())?;

    // CLI flags override config values
    let level = log_level.unwrap_or_else(|| loaded.agent.log_level.clone());
    logging::init(&level, log_format.unwrap_or(loaded.agent.log_format));

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(run_agent(loaded))
}

async fn run_agent(loaded: LoadedConfig) -> Result<()> {
    let LoadedConfig {
        source,
        agent,
        api,
        devices,
        rejected,
    } = loaded;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent = %agent.name,
        config = ?source,
        api = %api.base_url,
        vocabulary = VOCABULARY_VERSION,
        "devwatch agent starting"
    );
    for r in &rejected {
        warn!(device_id = %r.id, error = %r.error, "device rejected");
    }

    let api_client = ApiClient::new(api)?;
    let shutdown_token = CancellationToken::new();
    let (results_tx, results_rx) = mpsc::channel(agent.sync_queue_capacity);
    let (sync_tx, sync_rx) = mpsc::channel(agent.sync_queue_capacity);

    let mut scheduler = Scheduler::new(
        Prober::new()?,
        agent.max_concurrent_probes,
        results_tx,
        shutdown_token.clone(),
    );
    let scheduled: Vec<Arc<DeviceConfig>> = devices
        .into_iter()
        .filter(|device| match scheduler.schedule(device.clone()) {
            Ok(()) => true,
            Err(ScheduleError::Disabled(id)) => {
                info!(device_id = %id, "device disabled");
                false
            }
            Err(e) => {
                warn!(error = %e, "device not scheduled");
                false
            }
        })
        .collect();

    if scheduled.is_empty() {
        bail!("no devices could be scheduled; run `devwatch check` to see why");
    }
    info!(
        devices = scheduler.active().len(),
        rejected = rejected.len(),
        pool = agent.max_concurrent_probes,
        "monitoring started"
    );

    let pipeline = tokio::spawn(Pipeline::new(scheduled, sync_tx).run(results_rx));
    let worker = tokio::spawn(SyncWorker::new(api_client, agent.name.clone()).run(sync_rx));
    let signal = shutdown::cancel_on_signal(shutdown_token.clone());

    shutdown_token.cancelled().await;

    // Dropping the scheduler closes the result channel, which ends the
    // pipeline, which closes the sync channel.
    scheduler.shutdown(agent.shutdown_grace).await;
    let aborted = shutdown::join_with_grace(vec![pipeline, worker], agent.shutdown_grace).await;
    let _ = signal.await;

    info!(aborted, "devwatch agent stopped");
    Ok(())
}
