mod commands;
mod config;
mod domain;
mod error;
mod logging;
mod pipeline;
mod probe;
mod scheduler;
mod shutdown;
mod sync;

use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(name = "devwatch", version, about = "Network device monitoring agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring agent until Ctrl+C or SIGTERM
    Run {
        /// Path to config file (default: ~/.config/devwatch/agent.yaml)
        #[arg(long)]
        config: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Log output format: json or pretty (overrides config)
        #[arg(long)]
        log_format: Option<LogFormat>,
    },

    /// Validate the configuration and list devices
    Check {
        /// Path to config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Poll one device once and print the result
    Probe {
        /// Device id as configured
        device_id: String,

        /// Path to config file
        #[arg(long)]
        config: Option<String>,

        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Write a starter configuration file
    Init {
        /// Where to write it (default: ~/.config/devwatch/agent.yaml)
        #[arg(long)]
        config: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_level,
            log_format,
        } => commands::run::run(config, log_level, log_format),
        Commands::Check { config } => commands::check::run(config),
        Commands::Probe {
            device_id,
            config,
            format,
        } => commands::probe::run(&device_id, config, &format),
        Commands::Init { config, force } => commands::init::run(config, force),
    }
}
