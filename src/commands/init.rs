//! `devwatch init`: write a starter configuration.

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::config;

pub fn run(config_path: Option<String>, force: bool) -> Result<()> {
    let path = config::resolve_path(config_path.as_deref())?;
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let contents = config::sample_yaml()?;
    std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;

    println!("{} {}", "wrote".green(), path.display());
    println!("  next: edit the device list, then run `devwatch check`");
    Ok(())
}
