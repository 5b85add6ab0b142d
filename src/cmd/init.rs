//! Workspace initialization — `relay init`.

use std::path::Path;

use anyhow::Result;
use relay::config::RelayConfig;

use super::open_store;

pub fn cmd_init(config_path: &Path, config: &RelayConfig) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        config.save(config_path)?;
        println!("Wrote default config to {}", config_path.display());
    }

    let store = open_store(config)?;
    drop(store);
    println!("Store ready at {}", config.db_path().display());
    println!(
        "Initialized relay. Set {} before running `relay serve`.",
        config.server.secret_env
    );
    Ok(())
}
