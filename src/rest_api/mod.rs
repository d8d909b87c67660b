//! REST API served by the manager
//!
//! Health and metrics endpoints plus a read-only view of remediations.

mod dto;
mod handlers;
mod server;

pub use dto::RemediationSummary;
pub use server::{router, run_server, ApiState};
