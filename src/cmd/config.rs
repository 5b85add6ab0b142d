//! Configuration view and validation commands — `relay config`.

use std::path::Path;

use anyhow::{Context, Result};
use relay::config::RelayConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = RelayConfig::load_or_default(config_path)?;
            println!();
            println!("Relay Configuration");
            println!("===================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No relay.toml found at {}; using defaults", config_path.display());
            }
            println!();
            let content =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            println!("{}", content);

            println!("Effective values (with env overrides):");
            println!("  store.path = \"{}\"", config.db_path().display());
            println!("  server.bind = \"{}\"", config.bind());
            println!(
                "  secret = {}",
                if config.secret().is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let config = RelayConfig::load_or_default(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  {} {}", console::style("-").yellow(), warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    config_path.display()
                );
            }
            RelayConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
