use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Cancel `token` once a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutting down");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Wait up to `grace` for `handles`, then abort whatever is still running.
/// Returns how many tasks had to be aborted.
pub async fn join_with_grace(handles: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    let finished = tokio::time::timeout(grace, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if finished.is_ok() {
        return 0;
    }
    let stragglers = aborts.iter().filter(|h| !h.is_finished()).count();
    warn!(stragglers, grace_secs = grace.as_secs_f64(), "grace period elapsed, aborting tasks");
    for handle in aborts {
        handle.abort();
    }
    stragglers
}
