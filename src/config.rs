//! Command line and environment configuration
//!
//! Each role parses its flags once at startup and hands typed configs to the
//! components. Durations are given in whole seconds.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::apicheck::ApiCheckConfig;
use crate::error::{Error, Result};
use crate::peers::PeerConfig;
use crate::safe_time::SafeTimeConfig;
use crate::watchdog::{WatchdogMode, DEFAULT_WATCHDOG_PATH};

/// Health check settings shared by the agent and the manager. Both sides must
/// agree on them for the safe time estimates to hold.
#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Seconds between API server probes
    #[arg(long, env = "SELF_FENCE_CHECK_INTERVAL", default_value_t = 15)]
    pub check_interval_secs: u64,

    /// Consecutive failed probes before peers are consulted
    #[arg(long, env = "SELF_FENCE_MAX_ERRORS", default_value_t = 3)]
    pub max_errors_threshold: u32,

    /// Timeout of one API server probe, in seconds
    #[arg(long, env = "SELF_FENCE_API_TIMEOUT", default_value_t = 5)]
    pub api_server_timeout_secs: u64,

    /// Deadline of a peer quorum round, in seconds
    #[arg(long, env = "SELF_FENCE_PEER_REQUEST_TIMEOUT", default_value_t = 5)]
    pub peer_request_timeout_secs: u64,

    /// Extra seconds added to every safe time estimate
    #[arg(long, env = "SELF_FENCE_SAFETY_MARGIN", default_value_t = 15)]
    pub safety_margin_secs: u64,
}

impl CheckArgs {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn api_server_timeout(&self) -> Duration {
        Duration::from_secs(self.api_server_timeout_secs)
    }

    pub fn peer_request_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_request_timeout_secs)
    }

    pub fn safe_time_config(&self, watchdog_timeout: Duration) -> SafeTimeConfig {
        SafeTimeConfig {
            check_interval: self.check_interval(),
            max_errors_threshold: self.max_errors_threshold,
            watchdog_timeout,
            api_server_timeout: self.api_server_timeout(),
            peer_request_timeout: self.peer_request_timeout(),
            safety_margin: Duration::from_secs(self.safety_margin_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(Error::ConfigError(
                "check interval must be at least 1 second".to_string(),
            ));
        }
        if self.max_errors_threshold == 0 {
            return Err(Error::ConfigError(
                "max errors threshold must be at least 1".to_string(),
            ));
        }
        if self.api_server_timeout_secs == 0 || self.peer_request_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "timeouts must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-node agent settings
#[derive(Args, Debug, Clone)]
pub struct AgentConfig {
    /// Name of the node this agent runs on
    #[arg(long, env = "MY_NODE_NAME")]
    pub node_name: String,

    #[command(flatten)]
    pub checks: CheckArgs,

    /// Seconds between peer list refreshes
    #[arg(long, env = "SELF_FENCE_PEER_UPDATE_INTERVAL", default_value_t = 900)]
    pub peer_update_interval_secs: u64,

    /// Timeout for the remediation lookup done when answering a peer, in seconds
    #[arg(long, env = "SELF_FENCE_PEER_API_TIMEOUT", default_value_t = 5)]
    pub peer_api_server_timeout_secs: u64,

    /// Upper bound on peers asked per quorum round
    #[arg(long, env = "SELF_FENCE_MAX_PEERS", default_value_t = 7)]
    pub max_peers_to_query: usize,

    /// Port of the peer health server
    #[arg(long, env = "SELF_FENCE_PEER_PORT", default_value_t = 30001)]
    pub peer_port: u16,

    /// Watchdog selection
    #[arg(long, env = "SELF_FENCE_WATCHDOG_MODE", value_enum, default_value = "auto")]
    pub watchdog_mode: WatchdogMode,

    /// Watchdog device
    #[arg(long, env = "SELF_FENCE_WATCHDOG_PATH", default_value = DEFAULT_WATCHDOG_PATH)]
    pub watchdog_path: PathBuf,

    /// Timeout of the fake watchdog, in seconds
    #[arg(long, env = "SELF_FENCE_FAKE_WATCHDOG_TIMEOUT", default_value_t = 60)]
    pub fake_watchdog_timeout_secs: u64,

    /// Reboot via reboot(2) when no watchdog is available
    #[arg(long, env = "SELF_FENCE_SOFTWARE_REBOOT", default_value_t = true, action = clap::ArgAction::Set)]
    pub software_reboot_enabled: bool,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::ConfigError("node name must not be empty".to_string()));
        }
        if self.peer_update_interval_secs == 0 {
            return Err(Error::ConfigError(
                "peer update interval must be at least 1 second".to_string(),
            ));
        }
        self.checks.validate()
    }

    pub fn api_check_config(&self) -> ApiCheckConfig {
        ApiCheckConfig {
            node_name: self.node_name.clone(),
            check_interval: self.checks.check_interval(),
            max_errors_threshold: self.checks.max_errors_threshold,
            api_server_timeout: self.checks.api_server_timeout(),
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            my_node_name: self.node_name.clone(),
            update_interval: Duration::from_secs(self.peer_update_interval_secs),
            request_timeout: self.checks.peer_request_timeout(),
            max_peers_to_query: self.max_peers_to_query,
        }
    }

    pub fn peer_api_server_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_api_server_timeout_secs)
    }

    pub fn fake_watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.fake_watchdog_timeout_secs)
    }
}

/// Central remediation manager settings
#[derive(Args, Debug, Clone)]
pub struct ManagerConfig {
    #[command(flatten)]
    pub checks: CheckArgs,

    /// Watchdog timeout assumed for nodes that do not advertise one, in seconds
    #[arg(long, env = "SELF_FENCE_DEFAULT_WATCHDOG_TIMEOUT", default_value_t = 60)]
    pub default_watchdog_timeout_secs: u64,

    /// Lower bound on the time to assume a node rebooted, in seconds
    #[arg(long, env = "SELF_FENCE_MIN_SAFE_TIME", default_value_t = 0)]
    pub min_safe_time_secs: u64,

    /// Address of the health and metrics server
    #[arg(long, env = "SELF_FENCE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: std::net::SocketAddr,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        self.checks.validate()
    }

    pub fn safe_time_config(&self) -> SafeTimeConfig {
        self.checks
            .safe_time_config(Duration::from_secs(self.default_watchdog_timeout_secs))
    }

    pub fn min_safe_time(&self) -> Duration {
        Duration::from_secs(self.min_safe_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct AgentCli {
        #[command(flatten)]
        agent: AgentConfig,
    }

    #[derive(Parser)]
    struct ManagerCli {
        #[command(flatten)]
        manager: ManagerConfig,
    }

    #[test]
    fn test_agent_defaults() {
        let cli = AgentCli::parse_from(["agent", "--node-name", "worker-1"]);
        let config = cli.agent;
        config.validate().unwrap();

        let check = config.api_check_config();
        assert_eq!(check.check_interval, Duration::from_secs(15));
        assert_eq!(check.max_errors_threshold, 3);
        assert_eq!(check.api_server_timeout, Duration::from_secs(5));

        let peers = config.peer_config();
        assert_eq!(peers.update_interval, Duration::from_secs(900));
        assert_eq!(peers.max_peers_to_query, 7);
        assert_eq!(config.peer_port, 30001);
        assert_eq!(config.watchdog_mode, WatchdogMode::Auto);
        assert!(config.software_reboot_enabled);
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let cli = AgentCli::parse_from([
            "agent",
            "--node-name",
            "worker-1",
            "--max-errors-threshold",
            "0",
        ]);
        assert!(matches!(cli.agent.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_manager_safe_time_inputs() {
        let cli = ManagerCli::parse_from(["manager", "--default-watchdog-timeout-secs", "30"]);
        let st = cli.manager.safe_time_config();
        assert_eq!(st.watchdog_timeout, Duration::from_secs(30));
        assert_eq!(st.safety_margin, Duration::from_secs(15));
        assert_eq!(cli.manager.min_safe_time(), Duration::ZERO);
    }
}
