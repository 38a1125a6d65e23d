use anyhow::Result;
use colored::Colorize;

use crate::config;
use crate::domain::vocabulary;
use crate::error::ConfigError;

pub fn run(config_path: Option<String>) -> Result<()> {
    let loaded = config::load(config_path.as_deref())?;

    println!("{}", "devwatch check".bold());
    match &loaded.source {
        Some(path) => println!("  config:   {}", path.display()),
        None => println!("  config:   {}", "no file, using defaults".yellow()),
    }
    println!("  agent:    {}", loaded.agent.name);
    println!("  api:      {}", loaded.api.base_url);
    println!();

    for device in &loaded.devices {
        let state = if device.enabled {
            "ok".green()
        } else {
            "disabled".yellow()
        };
        println!(
            "  {:<24} {:<16} {:<16} {:<14} every {:>5}s  timeout {:>4}s  {}",
            device.id,
            device.device_type,
            device.address,
            device.methods_label(),
            device.poll_interval.as_secs_f64(),
            device.timeout.as_secs_f64(),
            state
        );
    }
    for rejected in &loaded.rejected {
        println!("  {:<24} {}  {}", rejected.id, "rejected".red(), rejected.error);
        if let ConfigError::UnknownMetric { device_type, .. } = &rejected.error {
            let known: Vec<_> = vocabulary::keys(*device_type).collect();
            println!("  {:<24} known metrics: {}", "", known.join(", ").dimmed());
        }
    }

    let enabled = loaded.devices.iter().filter(|d| d.enabled).count();
    println!();
    println!(
        "  {} valid ({} enabled), {} rejected",
        loaded.devices.len(),
        enabled,
        loaded.rejected.len()
    );

    if !loaded.rejected.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
