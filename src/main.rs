//! SQL Gateway - Main entry point.
//!
//! Registers the connection profiles from a JSON file, runs one command
//! against them and prints the outcome as JSON on stdout.

use clap::Parser;
use sql_gateway::config::{Command, Config};
use sql_gateway::error::DbError;
use sql_gateway::models::{ConfigId, ConfigurationRequest, SqlStatement};
use sql_gateway::service::DatabaseService;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_profiles(path: &Path) -> Result<Vec<ConfigurationRequest>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read profiles file {}: {}", path.display(), e))?;
    let profiles = serde_json::from_str(&raw)
        .map_err(|e| format!("Invalid profiles file {}: {}", path.display(), e))?;
    Ok(profiles)
}

async fn run(service: &DatabaseService, command: Command) -> Result<serde_json::Value, DbError> {
    let value = match command {
        Command::List => to_json(service.list()?)?,
        Command::Show { id } => to_json(service.get(ConfigId(id))?)?,
        Command::Metadata { id } => to_json(service.introspect(ConfigId(id)).await?)?,
        Command::Execute {
            id,
            sql,
            timeout_ms,
        } => {
            let statement = SqlStatement {
                config_id: ConfigId(id),
                sql,
                timeout_ms,
            };
            to_json(service.execute(&statement).await?)?
        }
    };
    Ok(value)
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value, DbError> {
    serde_json::to_value(value).map_err(|e| DbError::internal(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting SQL Gateway v{}", env!("CARGO_PKG_VERSION"));

    let service = DatabaseService::new(config.pool_settings(), config.executor_settings());

    if let Some(path) = &config.profiles {
        let profiles = load_profiles(path)?;
        info!(count = profiles.len(), "Registering connection profiles");
        for profile in profiles {
            let saved = service.save(profile)?;
            info!(config_id = %saved.id, name = %saved.name, "Registered profile");
        }
    }

    let outcome = run(&service, config.command.clone()).await;
    service.shutdown().await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            let body = serde_json::json!({
                "error": {
                    "code": e.kind().code(),
                    "message": e.to_string(),
                    "suggestion": e.suggestion(),
                }
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            std::process::exit(1);
        }
    }
}
