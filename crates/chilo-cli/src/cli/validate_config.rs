use std::path::PathBuf;

use anyhow::Context;
use chilo_core::config::Config;

/// Validates a `chilo` YAML config file without starting the mutation
/// pipeline: parses it and ensures every configured directory exists or can
/// be created (the same thin-loader contract `HostBridge::init` relies on).
#[derive(Debug, clap::Parser)]
pub struct ValidateConfig {
    /// Path to the YAML config file.
    config: PathBuf,
}

impl ValidateConfig {
    pub fn run(self) -> anyhow::Result<()> {
        let config = Config::load(&self.config).context("loading config")?;
        println!("config ok: {}", self.config.display());
        println!(
            "  target: {} {}",
            config.target.dbms, config.target.dbms_version
        );
        println!(
            "  workers: parser={} generator={} fixer={} structural={}",
            config.others.parser_threads,
            config.others.generator_threads,
            config.others.fixer_threads,
            config.others.structural_threads,
        );
        println!(
            "  energy: rate={} min={} max={}",
            config.energy.exchange_rate, config.energy.min_energy, config.energy.max_energy
        );
        println!("  map_size: {}", config.paths.map_size);
        Ok(())
    }
}
