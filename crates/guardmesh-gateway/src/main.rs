//! Guardmesh gateway binary.
//!
//! `guardmesh serve` runs a node: validation pipeline, learning loop,
//! replication, and the HTTP API. `guardmesh guardian <on|off|status>`
//! talks to a running node over that API.

use clap::{Parser, Subcommand};
use guardmesh_core::config::GuardianConfig;
use guardmesh_gateway::{api, config, AppState};
use std::path::PathBuf;
use tracing::info;

/// Guardmesh: security gateway for AI-agent tool invocations.
#[derive(Parser)]
#[command(name = "guardmesh", version, about, long_about = None)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(short, long, global = true, env = "GUARDMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "GUARDMESH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override log output format (text, json).
    #[arg(long, global = true, env = "GUARDMESH_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gateway node (default).
    Serve,
    /// Control the validation pipeline of a running node.
    Guardian {
        /// `on`, `off` (or `disable`), or `status` (default).
        action: Option<String>,
    },
    /// Validate a configuration file and print the resolved settings.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_and_merge_config(&cli)?;

    match cli.command {
        Some(Commands::Validate) => run_validate(&config),
        Some(Commands::Guardian { action }) => run_guardian(&config, action.as_deref()).await,
        Some(Commands::Serve) | None => {
            init_logging(&config)?;
            config::validate_config(&config)?;
            run_serve(config).await
        }
    }
}

/// Load configuration from file or defaults, then apply CLI overrides.
fn load_and_merge_config(cli: &Cli) -> anyhow::Result<GuardianConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            // Logging is not initialised yet; use eprintln for early
            // diagnostics.
            eprintln!("loading configuration from {}", path.display());
            config::load_config(path)?
        }
        None => GuardianConfig::default(),
    };

    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = &cli.log_format {
        config.logging.format.clone_from(format);
    }
    Ok(config)
}

fn run_validate(config: &GuardianConfig) -> anyhow::Result<()> {
    config::validate_config(config)?;
    println!("configuration is valid\n");
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// `guardian on|off|disable|status` — drives a running node's HTTP API.
async fn run_guardian(config: &GuardianConfig, action: Option<&str>) -> anyhow::Result<()> {
    let base = format!("http://{}", config.listen_addr);
    let client = reqwest::Client::new();

    match action.unwrap_or("status") {
        "on" => {
            let body: serde_json::Value = client
                .post(format!("{base}/api/guardian/toggle"))
                .json(&serde_json::json!({"enabled": true}))
                .send()
                .await?
                .json()
                .await?;
            println!("guardian enabled: {}", body["enabled"]);
        }
        "off" | "disable" => {
            let body: serde_json::Value = client
                .post(format!("{base}/api/guardian/toggle"))
                .json(&serde_json::json!({"enabled": false}))
                .send()
                .await?
                .json()
                .await?;
            println!("guardian enabled: {}", body["enabled"]);
        }
        "status" => {
            let body: serde_json::Value = client
                .get(format!("{base}/api/guardian/status"))
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        other => {
            eprintln!("unknown action '{other}'");
            eprintln!("usage: guardmesh guardian [on|off|disable|status]");
            std::process::exit(2);
        }
    }
    Ok(())
}

async fn run_serve(config: GuardianConfig) -> anyhow::Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        ledger = config.ledger.enabled,
        "starting guardmesh gateway"
    );
    let listen_addr = config.listen_addr.clone();
    let state = AppState::build(config).await?;
    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "gateway API listening");
    axum::serve(listener, app).await?;

    state.shutdown();
    Ok(())
}

/// Initialise structured logging from the resolved configuration.
/// `RUST_LOG` takes precedence for filter directives.
fn init_logging(config: &GuardianConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
    Ok(())
}
