//! Rebooting when a remediation is requested for this node
//!
//! While the API server is reachable, the agent does not need peers to learn it
//! was judged unhealthy: it sees the RemediationRequest itself. Requests older
//! than the current boot are ignored, so a node that already rebooted does not
//! reboot again while the request is still present.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crd::RemediationRequest;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reboot::Rebooter;

const PROC_STAT: &str = "/proc/stat";

/// Boot time from the `btime` line of `/proc/stat`
pub fn parse_boot_time(stat: &str) -> Option<DateTime<Utc>> {
    let secs = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse::<i64>()
        .ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

pub fn boot_time() -> Result<DateTime<Utc>> {
    let stat = std::fs::read_to_string(PROC_STAT)
        .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", PROC_STAT, e)))?;
    parse_boot_time(&stat)
        .ok_or_else(|| Error::ConfigError(format!("No btime in {}", PROC_STAT)))
}

/// Whether a request created at `created` targets the current boot
pub fn requested_since_boot(created: Option<DateTime<Utc>>, boot_time: DateTime<Utc>) -> bool {
    created.map(|c| c > boot_time).unwrap_or(false)
}

/// Watch RemediationRequests named after `node_name` and reboot on a fresh one
pub async fn watch_own_node(
    client: Client,
    node_name: String,
    boot_time: DateTime<Utc>,
    rebooter: Arc<dyn Rebooter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let api: Api<RemediationRequest> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", node_name));
    let mut stream = watcher(api, config)
        .default_backoff()
        .applied_objects()
        .boxed();

    info!("Watching remediation requests for {}", node_name);

    loop {
        tokio::select! {
            next = stream.try_next() => {
                match next {
                    Ok(Some(rr)) => {
                        let created = rr.creation_timestamp().map(|t| t.0);
                        if !requested_since_boot(created, boot_time) {
                            debug!(
                                "Ignoring remediation {}/{} from before boot",
                                rr.namespace().unwrap_or_default(),
                                rr.name_any()
                            );
                            continue;
                        }
                        warn!(
                            "Remediation requested for {} in {}, rebooting",
                            node_name,
                            rr.namespace().unwrap_or_default()
                        );
                        match rebooter.reboot() {
                            Ok(()) => {
                                metrics::inc_reboots_triggered(&node_name);
                                return;
                            }
                            Err(e) => warn!("Failed to engage reboot: {}", e),
                        }
                    }
                    Ok(None) => {
                        warn!("Remediation watch ended");
                        return;
                    }
                    Err(e) => debug!("Remediation watch error: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Remediation watch shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  2255 34 2290 22625563 6290 127 456 0 0 0\n\
                        intr 114930548 113199788 3 0 5 263 0 4\n\
                        ctxt 1990473\n\
                        btime 1700000000\n\
                        processes 2915\n";

    #[test]
    fn test_parse_boot_time() {
        let boot = parse_boot_time(STAT).unwrap();
        assert_eq!(boot.timestamp(), 1_700_000_000);
        assert!(parse_boot_time("cpu 1 2 3\n").is_none());
        assert!(parse_boot_time("btime soon\n").is_none());
    }

    #[test]
    fn test_only_requests_after_boot_count() {
        let boot = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let before = Utc.timestamp_opt(1_699_999_000, 0).unwrap();
        let after = Utc.timestamp_opt(1_700_000_500, 0).unwrap();

        assert!(requested_since_boot(Some(after), boot));
        assert!(!requested_since_boot(Some(before), boot));
        assert!(!requested_since_boot(None, boot));
    }
}
