//! `devwatch probe`: run one poll cycle for one device and print the
//! outcome. Nothing is sent to the API.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::domain::scoring::RiskLevel;
use crate::domain::status_engine::StatusEngine;
use crate::domain::thresholds::Breach;
use crate::domain::types::{PollResult, Status};
use crate::probe::Prober;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReport<'a> {
    device_id: &'a str,
    address: &'a str,
    methods: String,
    status: Status,
    predictive_score: u8,
    risk_level: RiskLevel,
    recommended_action: &'static str,
    breaches: &'a [Breach],
    result: &'a PollResult,
}

pub fn run(device_id: &str, config_path: Option<String>, format: &str) -> Result<()> {
    let loaded = config::load(config_path.as_deref())?;
    let Some(device) = loaded.device(device_id).cloned() else {
        if let Some(error) = loaded.rejection(device_id) {
            bail!("device {device_id} is rejected by the configuration: {error}");
        }
        bail!("no device '{device_id}' in the configuration");
    };
    if device.methods.is_empty() {
        bail!("device {device_id} has no monitoring methods");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let prober = Prober::new()?;
        let pool = Semaphore::new(device.methods.len());
        prober
            .poll(&device, &pool, &CancellationToken::new())
            .await
            .context("poll cycle was cancelled")
    })?;

    // A single unreachable result never confirms offline, so the reported
    // status for a down device is the provisional one.
    let mut engine = StatusEngine::new();
    let observation = engine.observe(&result, &device.thresholds, Utc::now());
    let risk = RiskLevel::from_score(observation.score);

    let report = ProbeReport {
        device_id: &device.id,
        address: &device.address,
        methods: device.methods_label(),
        status: observation.current,
        predictive_score: observation.score,
        risk_level: risk,
        recommended_action: risk.recommended_action(),
        breaches: &observation.evaluation.breaches,
        result: &result,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_table(&report),
    }
    Ok(())
}

fn print_table(report: &ProbeReport<'_>) {
    let result = report.result;
    let status = match report.status {
        Status::Online => "online".green(),
        Status::Warning => "warning".yellow(),
        Status::Critical => "critical".red(),
        Status::Offline => "offline".red().dimmed(),
    };

    println!("{}", format!("═══ {} ═══", report.device_id).cyan().bold());
    println!("  Address:     {}", report.address);
    println!("  Methods:     {}", report.methods);
    println!(
        "  Reachable:   {}",
        if result.reachable { "yes".green() } else { "no".red() }
    );
    if let Some(latency) = result.latency_ms {
        println!("  Latency:     {latency:.1} ms");
    }
    println!("  Status:      {status}");
    println!(
        "  Score:       {} ({:?}, {})",
        report.predictive_score, report.risk_level, report.recommended_action
    );

    if !result.metrics.is_empty() {
        println!();
        println!("{}", "── Metrics ──".yellow());
        let mut metrics: Vec<_> = result.metrics.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in metrics {
            println!("  {key:<24} {value:.2}");
        }
    }

    if !report.breaches.is_empty() {
        println!();
        println!("{}", "── Thresholds ──".yellow());
        for breach in report.breaches {
            println!(
                "  {:<24} {:.2} >= {} ({})",
                breach.key, breach.value, breach.bound, breach.severity
            );
        }
    }

    if !result.probe_errors.is_empty() {
        println!();
        println!("{}", "── Probe errors ──".yellow());
        for error in &result.probe_errors {
            println!("  {}", error.to_string().red());
        }
    }
}
