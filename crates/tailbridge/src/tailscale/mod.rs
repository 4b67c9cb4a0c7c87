//! Mesh side of the daemon: reading the node's serve and funnel state and
//! applying service bindings, plus the optional admin API sync.

pub mod api;
pub mod cli;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use api::ApiClient;
pub use cli::CliMesh;
pub use status::{FunnelStatus, ServeStatus};

use crate::service::DesiredService;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("{detail}")]
    NotFound { detail: String },
    #[error("serve config conflict: {detail}")]
    ConfigConflict { detail: String },
    #[error("node is untagged: {detail}")]
    UntaggedNode { detail: String },
    #[error("{command} failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("{command} produced non-JSON output: {preview}")]
    InvalidJson { command: String, preview: String },
    #[error("failed to decode {command} output: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MeshError {
    /// True when the daemon socket is unreachable or the binary is missing,
    /// as opposed to a request being rejected. Callers treat this as "skip
    /// the pass and retry".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Launch { .. } | Self::Timeout { .. })
    }
}

#[async_trait]
pub trait MeshControl: Send + Sync {
    async fn serve_status(&self) -> Result<ServeStatus, MeshError>;

    async fn funnel_status(&self) -> Result<FunnelStatus, MeshError>;

    /// Applies the serve binding and, when present, the funnel binding of one
    /// service. Callers delete first when replacing an existing config.
    async fn apply_service(&self, service: &DesiredService) -> Result<(), MeshError>;

    /// Clears the whole config of one service, funnel included. Deleting a
    /// service that is already gone is not an error.
    async fn delete_service(&self, qualified_name: &str) -> Result<(), MeshError>;
}

pub type DynMeshControl = Arc<dyn MeshControl>;
