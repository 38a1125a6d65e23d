//! Protocol probes and the per-device poll cycle.

pub mod http;
pub mod ping;
pub mod snmp;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::domain::device::DeviceConfig;
use crate::domain::types::{Method, Metrics, PollResult};
use crate::error::ProbeError;

/// What one method contributed to a poll cycle.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub method: Method,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub metrics: Metrics,
    pub error: Option<ProbeError>,
}

impl Fragment {
    pub fn failed(method: Method, error: ProbeError) -> Self {
        Self {
            method,
            reachable: false,
            latency_ms: None,
            metrics: Metrics::new(),
            error: Some(error),
        }
    }
}

/// Dispatches a method to its probe. Cheap to clone.
#[derive(Clone)]
pub struct Prober {
    http: reqwest::Client,
}

impl Prober {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("devwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building probe HTTP client")?;
        Ok(Self { http })
    }

    /// Run one method, never past `timeout`.
    pub async fn probe(&self, method: Method, device: &DeviceConfig, timeout: Duration) -> Fragment {
        let run = async {
            match method {
                Method::Ping => ping::probe(device, timeout).await,
                Method::Snmp => snmp::probe(device, timeout).await,
                Method::Http => http::probe(&self.http, device, timeout).await,
            }
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(fragment) => fragment,
            Err(_) => Fragment::failed(method, ProbeError::timeout(method, timeout)),
        }
    }

    /// One poll cycle: every configured method side by side, each holding a
    /// pool permit while it runs. Returns `None` when cancelled while waiting
    /// for permits; probes that already started run to completion.
    pub async fn poll(
        &self,
        device: &DeviceConfig,
        pool: &Semaphore,
        cancel: &CancellationToken,
    ) -> Option<PollResult> {
        let runs = device.methods.iter().map(|&method| async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = pool.acquire() => permit.ok()?,
            };
            Some(self.probe(method, device, device.timeout).await)
        });

        let fragments: Option<Vec<Fragment>> = join_all(runs).await.into_iter().collect();
        Some(merge_fragments(&device.id, fragments?))
    }
}

/// Fold fragments in configured method order. A key already present is kept
/// and the later value is stored as `<method>.<key>`, so no key is lost.
pub fn merge_fragments(device_id: &str, fragments: Vec<Fragment>) -> PollResult {
    let mut metrics = Metrics::new();
    let mut reachable = false;
    let mut probe_errors = Vec::new();
    let latency = |m: Method| {
        fragments
            .iter()
            .find(|f| f.method == m)
            .and_then(|f| f.latency_ms)
    };
    let latency_ms = latency(Method::Ping)
        .or_else(|| latency(Method::Http))
        .or_else(|| latency(Method::Snmp));

    for fragment in fragments {
        reachable |= fragment.reachable;
        let mut entries: Vec<(String, f64)> = fragment.metrics.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in entries {
            if metrics.contains_key(&key) {
                metrics.insert(format!("{}.{}", fragment.method, key), value);
            } else {
                metrics.insert(key, value);
            }
        }
        if let Some(error) = fragment.error {
            probe_errors.push(error);
        }
    }

    PollResult {
        device_id: device_id.to_string(),
        timestamp: Utc::now(),
        reachable,
        latency_ms,
        metrics,
        probe_errors,
    }
}
