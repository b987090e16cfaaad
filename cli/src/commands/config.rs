// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use iof_core::domain::forwarder_config::{
    ForwarderConfigManifest, LoggingConfig, ObservabilityConfig, ProjectionConfig,
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./iof-config.yaml)
        #[arg(short, long, default_value = "./iof-config.yaml")]
        output: PathBuf,

        /// Include sample projections and logging settings
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = ForwarderConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. IOF_CONFIG_PATH: {}",
            std::env::var("IOF_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./iof-config.yaml");
        println!("  4. ~/.iof/config.yaml");
        println!("  5. /etc/iof/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  ID: {}", spec.node.id);
    println!("  Rank: {}", spec.node.rank);
    println!();

    println!("{}", "Server group:".bold());
    println!("  Name: {}", spec.group.name);
    println!("  Primary service rank: {}", spec.group.primary_rank);
    println!();

    println!("{}", "Capabilities:".bold());
    println!("  Version: {}", spec.capabilities.version);
    println!("  Growth delta: {} slots", spec.capabilities.growth_delta);
    println!();

    println!("{}", "Requests:".bold());
    println!(
        "  Max transient resends: {}",
        spec.requests.max_transient_resends
    );
    println!("  Descriptor pool target: {}", spec.requests.pool_target);
    println!();

    println!("{}", "Projections:".bold());
    if spec.projections.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for projection in &spec.projections {
        let failover = if projection.failover {
            "failover".green()
        } else {
            "no failover".yellow()
        };
        println!("  {} ({})", projection.name.bold(), failover);
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ForwarderConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    let config = sample_config(with_examples);

    config
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

/// Default manifest, optionally with sample projections and logging.
pub fn sample_config(with_examples: bool) -> ForwarderConfigManifest {
    let mut config = ForwarderConfigManifest::default();
    if with_examples {
        config.spec.projections = vec![
            ProjectionConfig {
                name: "scratch".to_string(),
                failover: true,
            },
            ProjectionConfig {
                name: "home".to_string(),
                failover: false,
            },
        ];
        config.spec.observability = Some(ObservabilityConfig {
            logging: Some(LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            }),
        });
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iof-config.yaml");

        generate(&path, true).await.unwrap();

        let loaded = ForwarderConfigManifest::from_yaml_file(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.spec.projections.len(), 2);
        assert!(!loaded.spec.projections[1].failover);
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        let mut config = sample_config(false);
        config.kind = "NodeConfig".to_string();
        config.to_yaml_file(&path).unwrap();

        assert!(validate(Some(path)).await.is_err());
    }
}
