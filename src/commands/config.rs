use std::path::Path;

use clap::Subcommand;

use super::load_config;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load and validate the config, then print the effective settings
    Check,
}

impl ConfigCommand {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        match self {
            Self::Check => {
                let config = load_config(config_path)?;
                println!("{}", toml::to_string_pretty(&config)?);
                eprintln!("config ok: {}", config.repo);
                Ok(())
            }
        }
    }
}
