//! API server connectivity check
//!
//! Runs on every node. Each cycle probes the API server. Failures are counted
//! and tolerated until `max_errors_threshold` consecutive ones, then the peers
//! are asked whether this node has been judged unhealthy. Only a
//! peer-confirmed Unhealthy verdict engages the rebooter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::peers::{HealthCheckResult, PeerHealth};
use crate::reboot::Rebooter;

/// Where the check stands after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Checking,
    /// Threshold reached, peers are being consulted
    Escalated,
    /// Reboot engaged. Terminal for this process.
    Fencing,
    /// The previous cycles failed and this one succeeded
    Recovered,
}

/// One round trip to the API server
#[async_trait]
pub trait ApiProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Probes `/version` through the kube client
pub struct KubeApiProbe {
    client: Client,
}

impl KubeApiProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApiProbe for KubeApiProbe {
    async fn probe(&self) -> Result<()> {
        self.client.apiserver_version().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApiCheckConfig {
    pub node_name: String,
    pub check_interval: Duration,
    pub max_errors_threshold: u32,
    /// Budget for one probe; exceeding it counts as a failure
    pub api_server_timeout: Duration,
}

/// The periodic check. Owns the error count; nothing else mutates it.
pub struct ApiConnectivityCheck {
    config: ApiCheckConfig,
    probe: Arc<dyn ApiProbe>,
    peers: Arc<dyn PeerHealth>,
    rebooter: Arc<dyn Rebooter>,
    error_count: u32,
    state: ConnectivityState,
}

impl ApiConnectivityCheck {
    pub fn new(
        config: ApiCheckConfig,
        probe: Arc<dyn ApiProbe>,
        peers: Arc<dyn PeerHealth>,
        rebooter: Arc<dyn Rebooter>,
    ) -> Self {
        Self {
            config,
            probe,
            peers,
            rebooter,
            error_count: 0,
            state: ConnectivityState::Checking,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    async fn probe_once(&self) -> Result<()> {
        match tokio::time::timeout(self.config.api_server_timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.api_server_timeout)),
        }
    }

    /// Run one probe and whatever escalation it warrants
    pub async fn run_cycle(&mut self) -> ConnectivityState {
        if self.state == ConnectivityState::Fencing {
            return self.state;
        }

        let node = self.config.node_name.clone();
        match self.probe_once().await {
            Ok(()) => {
                let had_errors = self.error_count > 0;
                self.error_count = 0;
                metrics::set_api_check_errors(&node, 0);
                self.state = if had_errors {
                    info!("API server reachable again, resetting error count");
                    ConnectivityState::Recovered
                } else {
                    debug!("API server check succeeded");
                    ConnectivityState::Checking
                };
                return self.state;
            }
            Err(e) => {
                self.error_count = self.error_count.saturating_add(1);
                metrics::set_api_check_errors(&node, self.error_count);
                error!(
                    error_count = self.error_count,
                    threshold = self.config.max_errors_threshold,
                    "failed to check api server: {}",
                    e
                );
            }
        }

        if self.error_count < self.config.max_errors_threshold {
            self.state = ConnectivityState::Checking;
            return self.state;
        }

        info!("Error count reached threshold, asking peers about {}", node);
        self.state = ConnectivityState::Escalated;
        match self.peers.is_healthy(&node).await {
            HealthCheckResult::Healthy => {
                info!("Peers consider {} healthy, not fencing", node);
            }
            HealthCheckResult::ApiServerUnreachable => {
                warn!("API server outage is cluster-wide, not fencing {}", node);
            }
            HealthCheckResult::Unhealthy => {
                warn!("Peers confirmed {} is unhealthy, rebooting", node);
                match self.rebooter.reboot() {
                    Ok(()) => {
                        metrics::inc_reboots_triggered(&node);
                        self.state = ConnectivityState::Fencing;
                    }
                    Err(e) => error!("Failed to engage reboot, retrying next cycle: {}", e),
                }
            }
        }
        self.state
    }

    /// Run cycles every `check_interval` until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            threshold = self.config.max_errors_threshold,
            "Starting API connectivity check"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.run_cycle().await == ConnectivityState::Fencing {
                        info!("Fencing engaged, API connectivity check stops");
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("API connectivity check shutting down");
                        return;
                    }
                }
            }
        }
    }
}
