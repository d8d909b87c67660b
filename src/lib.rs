//! self-fence: node self-fencing agent and remediation controller
//!
//! Every node runs an agent that watches its own connectivity to the API
//! server. When it loses it for long enough and its peers confirm it has been
//! judged unhealthy, it stops feeding its watchdog and the node resets. A
//! central controller waits until such a node is provably down before
//! releasing its workloads.

pub mod agent;
pub mod apicheck;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod peers;
pub mod reboot;
pub mod rest_api;
pub mod safe_time;
pub mod watchdog;

pub use crate::error::{Error, Result};
