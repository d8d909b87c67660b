//! Per-node agent
//!
//! Wires the watchdog, the rebooter, the peer manager and server, the API
//! connectivity check and the own-node remediation watch into one process,
//! then waits for a shutdown signal.

mod self_remediation;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::apicheck::{ApiConnectivityCheck, KubeApiProbe};
use crate::config::AgentConfig;
use crate::crd::{AGENT_SAFE_TIME_ANNOTATION, WATCHDOG_TIMEOUT_ANNOTATION};
use crate::error::{with_deadline, Error, Result};
use crate::peers::{
    peer_health_router, HttpPeerClient, KubePeerSource, KubeRemediationLookup, PeerManager,
    PeerServerState,
};
use crate::reboot::WatchdogRebooter;
use crate::safe_time::{AgentSafeTimeCalculator, SafeTimeCalculator};
use crate::watchdog::{self, select_watchdog};

pub use self_remediation::{boot_time, parse_boot_time, requested_since_boot, watch_own_node};

/// Publish the agent's watchdog timeout and safe time on its Node, giving up
/// after `timeout`
pub async fn annotate_node(
    client: &Client,
    node_name: &str,
    watchdog_timeout: Duration,
    safe_time: Duration,
    timeout: Duration,
) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                WATCHDOG_TIMEOUT_ANNOTATION: watchdog_timeout.as_secs().to_string(),
                AGENT_SAFE_TIME_ANNOTATION: safe_time.as_secs().to_string(),
            }
        }
    });
    with_deadline(timeout, async {
        api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)
    })
    .await?;
    Ok(())
}

/// Run the agent until ctrl-c or until a core task exits
pub async fn run_agent(client: Client, config: AgentConfig) -> Result<()> {
    config.validate()?;
    let node_name = config.node_name.clone();
    info!("Starting self-fence agent on node {}", node_name);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dog = select_watchdog(
        config.watchdog_mode,
        &config.watchdog_path,
        config.fake_watchdog_timeout(),
    )?;
    let watchdog_timeout = dog
        .as_ref()
        .map(|d| d.timeout())
        .unwrap_or_else(|| config.fake_watchdog_timeout());
    let feed_handle = dog
        .as_ref()
        .map(|d| watchdog::start(Arc::clone(d), shutdown_rx.clone()));
    let rebooter = Arc::new(WatchdogRebooter::new(dog, config.software_reboot_enabled));

    let calculator = AgentSafeTimeCalculator::new(config.checks.safe_time_config(watchdog_timeout));
    let safe_time = calculator.time_to_assume_rebooted(Some(watchdog_timeout))?;
    info!(
        watchdog_timeout_secs = watchdog_timeout.as_secs(),
        safe_time_secs = safe_time.as_secs(),
        "Computed safe time"
    );
    if let Err(e) = annotate_node(
        &client,
        &node_name,
        watchdog_timeout,
        safe_time,
        config.checks.api_server_timeout(),
    )
    .await
    {
        warn!("Failed to annotate node {}: {}", node_name, e);
    }

    let peer_client = Arc::new(HttpPeerClient::new(
        config.peer_port,
        config.checks.peer_request_timeout(),
    )?);
    let peer_source = Arc::new(KubePeerSource::new(
        client.clone(),
        config.checks.api_server_timeout(),
    ));
    let peers = Arc::new(PeerManager::new(config.peer_config(), peer_source, peer_client));
    let peers_handle = tokio::spawn(Arc::clone(&peers).run(shutdown_rx.clone()));

    let server_state = PeerServerState {
        lookup: Arc::new(KubeRemediationLookup::new(client.clone())),
        api_server_timeout: config.peer_api_server_timeout(),
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], config.peer_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Peer health server listening on {}", addr);
    let server_handle = tokio::spawn({
        let mut shutdown = shutdown_rx.clone();
        let app = peer_health_router(server_state);
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
        }
    });

    let check = ApiConnectivityCheck::new(
        config.api_check_config(),
        Arc::new(KubeApiProbe::new(client.clone())),
        peers,
        rebooter.clone(),
    );
    let check_handle = tokio::spawn(check.run(shutdown_rx.clone()));

    match boot_time() {
        Ok(boot) => {
            tokio::spawn(watch_own_node(
                client.clone(),
                node_name.clone(),
                boot,
                rebooter.clone(),
                shutdown_rx.clone(),
            ));
        }
        Err(e) => warn!("Own-node remediation watch disabled: {}", e),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        result = check_handle => {
            if let Err(e) = result {
                error!("API connectivity check panicked: {}", e);
            } else if rebooter.is_engaged() {
                info!("Fencing engaged, waiting for the node to go down");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        result = server_handle => match result {
            Ok(Ok(())) => warn!("Peer health server exited"),
            Ok(Err(e)) => error!("Peer health server error: {}", e),
            Err(e) => error!("Peer health server panicked: {}", e),
        },
    }

    let _ = shutdown_tx.send(true);
    peers_handle.abort();
    if let Some(handle) = feed_handle {
        if let Err(e) = handle.await {
            error!("Watchdog feed loop panicked: {}", e);
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}
