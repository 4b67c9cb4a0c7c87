//! tailbridge keeps a host's Tailscale serve and funnel configuration in sync
//! with the set of labeled Docker containers running on that host.
//!
//! Containers opt in through `tailbridge.*` labels. The daemon watches
//! container lifecycle events, rebuilds the intended exposure state on every
//! pass, diffs it against what the `tailscale` CLI reports, and applies the
//! difference. All durable state lives in the tailnet itself; the process can
//! crash or restart at any time and will re-derive everything.

pub mod config;
pub mod interpret;
pub mod labels;
pub mod reconcile;
pub mod resolve;
pub mod runner;
pub mod runtime;
pub mod service;
pub mod state;
pub mod tailscale;
pub mod telemetry;
pub mod version;

#[cfg(test)]
pub mod test_support;

/// Header attached to tailnet admin API requests for correlation.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
