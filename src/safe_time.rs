//! Time to assume a fenced node has rebooted
//!
//! A node that loses API access needs `max_errors_threshold` failed checks
//! before it escalates, and then up to one watchdog timeout before the device
//! resets it. Whoever reassigns its workloads must wait at least that long.
//!
//! Two calculators exist. The agent computes its own estimate from its own
//! device timeout and publishes it on its Node. The manager computes a more
//! conservative estimate that also covers probe and peer-query latency, and
//! never goes below what the agent advertised.

use std::time::Duration;

use crate::error::{Error, Result};

/// Inputs to the safe time calculation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeTimeConfig {
    pub check_interval: Duration,
    pub max_errors_threshold: u32,
    pub watchdog_timeout: Duration,
    pub api_server_timeout: Duration,
    pub peer_request_timeout: Duration,
    pub safety_margin: Duration,
}

impl SafeTimeConfig {
    /// Reject configurations for which no upper bound can be given
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::SafeTimeError(
                "check interval must be greater than zero".to_string(),
            ));
        }
        if self.max_errors_threshold == 0 {
            return Err(Error::SafeTimeError(
                "max errors threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `max_errors_threshold * check_interval + watchdog_timeout + safety_margin`
pub fn agent_safe_time(config: &SafeTimeConfig) -> Result<Duration> {
    config.validate()?;
    config
        .check_interval
        .checked_mul(config.max_errors_threshold)
        .and_then(|d| d.checked_add(config.watchdog_timeout))
        .and_then(|d| d.checked_add(config.safety_margin))
        .ok_or_else(|| Error::SafeTimeError("safe time overflows".to_string()))
}

/// Agent estimate plus one probe timeout per counted error and one peer round
pub fn manager_safe_time(config: &SafeTimeConfig) -> Result<Duration> {
    let agent = agent_safe_time(config)?;
    config
        .api_server_timeout
        .checked_mul(config.max_errors_threshold)
        .and_then(|d| d.checked_add(config.peer_request_timeout))
        .and_then(|d| d.checked_add(agent))
        .ok_or_else(|| Error::SafeTimeError("safe time overflows".to_string()))
}

/// Computes how long to wait before a fenced node is assumed down
pub trait SafeTimeCalculator: Send + Sync {
    /// `watchdog_timeout` overrides the configured device timeout when the
    /// node advertised its own.
    fn time_to_assume_rebooted(&self, watchdog_timeout: Option<Duration>) -> Result<Duration>;

    fn is_agent(&self) -> bool;
}

/// The agent's estimate of its own worst case
#[derive(Debug, Clone)]
pub struct AgentSafeTimeCalculator {
    config: SafeTimeConfig,
}

impl AgentSafeTimeCalculator {
    pub fn new(config: SafeTimeConfig) -> Self {
        Self { config }
    }
}

impl SafeTimeCalculator for AgentSafeTimeCalculator {
    fn time_to_assume_rebooted(&self, watchdog_timeout: Option<Duration>) -> Result<Duration> {
        let mut config = self.config.clone();
        if let Some(timeout) = watchdog_timeout {
            config.watchdog_timeout = timeout;
        }
        agent_safe_time(&config)
    }

    fn is_agent(&self) -> bool {
        true
    }
}

/// The reconciler's conservative estimate
#[derive(Debug, Clone)]
pub struct ManagerSafeTimeCalculator {
    config: SafeTimeConfig,
    /// Administrator configured floor
    minimum: Duration,
}

impl ManagerSafeTimeCalculator {
    pub fn new(config: SafeTimeConfig, minimum: Duration) -> Self {
        Self { config, minimum }
    }
}

impl SafeTimeCalculator for ManagerSafeTimeCalculator {
    fn time_to_assume_rebooted(&self, watchdog_timeout: Option<Duration>) -> Result<Duration> {
        let mut config = self.config.clone();
        if let Some(timeout) = watchdog_timeout {
            config.watchdog_timeout = timeout;
        }
        let computed = manager_safe_time(&config)?;
        Ok(computed.max(self.minimum))
    }

    fn is_agent(&self) -> bool {
        false
    }
}
