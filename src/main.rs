//! self-fence binary: `agent` on every node, `manager` once per cluster

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use self_fence::config::{AgentConfig, ManagerConfig};
use self_fence::controller::{run_controller, ControllerState, KubeClusterOps, Remediator};
use self_fence::rest_api::{run_server, ApiState};
use self_fence::safe_time::ManagerSafeTimeCalculator;

#[derive(Parser)]
#[command(name = "self-fence")]
#[command(about = "Node self-fencing agent and remediation controller", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "SELF_FENCE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "SELF_FENCE_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the per-node agent
    Agent(AgentConfig),
    /// Run the remediation controller
    Manager(ManagerConfig),
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    match cli.command {
        Commands::Agent(config) => self_fence::agent::run_agent(client, config)
            .await
            .context("agent failed")?,
        Commands::Manager(config) => run_manager(client, config)
            .await
            .context("manager failed")?,
    }
    Ok(())
}

async fn run_manager(client: Client, config: ManagerConfig) -> Result<()> {
    config.validate()?;
    info!("Starting self-fence manager");

    let calculator = Arc::new(ManagerSafeTimeCalculator::new(
        config.safe_time_config(),
        config.min_safe_time(),
    ));
    let remediator = Remediator::new(
        Arc::new(KubeClusterOps::new(
            client.clone(),
            config.checks.api_server_timeout(),
        )),
        calculator,
    );
    let state = Arc::new(ControllerState::new(client.clone(), remediator));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(run_server(
        Arc::new(ApiState {
            client: client.clone(),
        }),
        config.listen,
        shutdown_rx,
    ));

    // returns once the controller has handled a shutdown signal
    let result = run_controller(state).await;

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("REST API server error: {}", e),
        Err(e) => error!("REST API server panicked: {}", e),
    }

    info!("Manager shutdown complete");
    result?;
    Ok(())
}
