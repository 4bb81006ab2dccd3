//! # Resilience Configuration Validator
//!
//! Command-line tool for validating `resilience.yaml` for one or more
//! environments before a service starts with it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tasker_resilience::config::{ConfigManager, ResilienceConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const KNOWN_ENVIRONMENTS: &[&str] = &["development", "test", "production"];

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate resilience configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Directory containing resilience.yaml (default: $TASKER_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every section
    All,

    /// Validate one section
    Component {
        /// retry, circuit_breakers, batch, timeouts or stream
        name: String,
    },

    /// Validate the file for every known environment
    Environments,

    /// Print the effective configuration
    Show {
        /// yaml or json
        #[arg(long, default_value = "yaml")]
        format: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all_config(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Environments) => validate_environments(&cli),
        Some(Commands::Show { format }) => show_config(&cli, format),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            eprintln!("❌ {e}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> Result<ResilienceConfig, Box<dyn std::error::Error>> {
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)?;
    println!(
        "✅ Loaded {} for '{}'",
        manager.config_file().display(),
        manager.environment()
    );
    Ok(manager.config().clone())
}

fn validate_all_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔧 Validating Resilience Configuration");
    println!("Environment: {}", cli.environment);
    println!();

    let config = load(cli, &cli.environment)?;
    for section in ["retry", "circuit_breakers", "batch", "timeouts", "stream"] {
        validate_section(&config, section)?;
    }

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, component_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔧 Validating Component: {component_name}");
    let config = load(cli, &cli.environment)?;
    validate_section(&config, &component_name.to_lowercase().replace('-', "_"))?;
    println!("✅ Component '{component_name}' validation passed!");
    Ok(())
}

fn validate_environments(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    println!("📋 Validating every environment");
    let mut failures = Vec::new();

    for environment in KNOWN_ENVIRONMENTS {
        match load(cli, environment) {
            Ok(_) => println!("   ✅ {environment}"),
            Err(e) => {
                println!("   ❌ {environment}: {e}");
                failures.push(environment.to_string());
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(format!("invalid for: {}", failures.join(", ")).into())
    }
}

fn show_config(cli: &Cli, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(cli, &cli.environment)?;
    let rendered = match format {
        "json" => serde_json::to_string_pretty(&config)?,
        "yaml" => serde_yaml::to_string(&config)?,
        other => return Err(format!("Unknown format: {other}").into()),
    };
    println!("{rendered}");
    Ok(())
}

fn validate_section(
    config: &ResilienceConfig,
    section: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match section {
        "retry" => {
            println!("🔁 Validating Retry Configuration...");
            let retry = config.retry.to_retry_config();
            retry.validate()?;
            println!(
                "   ✅ {} attempts, {:?} backoff from {:?}",
                retry.max_attempts, retry.strategy, retry.base_delay
            );
        }
        "circuit_breakers" => {
            println!("⚡ Validating Circuit Breaker Configuration...");
            config.circuit_breakers.validate()?;
            println!(
                "   ✅ Max breakers: {}, component overrides: {}",
                config.circuit_breakers.max_circuit_breakers,
                config.circuit_breakers.component_configs.len()
            );
        }
        "batch" => {
            println!("📦 Validating Batch Configuration...");
            let batch = config.batch.to_batch_config();
            batch.validate()?;
            println!(
                "   ✅ Size {}..={}, wait {:?}, concurrency {}, {:?}",
                batch.min_batch_size,
                batch.max_batch_size,
                batch.max_wait_time,
                batch.concurrency,
                batch.error_handling
            );
        }
        "timeouts" => {
            println!("⏱️  Validating Timeout Configuration...");
            let timeouts = config.timeouts.to_timeout_config();
            timeouts.validate()?;
            println!(
                "   ✅ Default {:?}, sweep {:?}",
                timeouts.default_timeout, timeouts.cleanup_interval
            );
        }
        "stream" => {
            println!("🌊 Validating Stream Configuration...");
            let stream = config.stream.to_stream_config();
            stream.validate()?;
            println!(
                "   ✅ Concurrency {}, memory threshold {}MB",
                stream.concurrency, stream.memory_threshold_mb
            );
        }
        other => return Err(format!("Unknown component: {other}").into()),
    }
    Ok(())
}
