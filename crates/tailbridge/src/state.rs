//! Shared process context handed to the long-running tasks. The daemon keeps
//! no state of its own between passes; everything is re-derived from the
//! container runtime and the mesh.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::runtime::DynContainerRuntime;
use crate::tailscale::{ApiClient, DynMeshControl};

pub struct AppContext {
    pub cfg: AppConfig,
    pub runtime: DynContainerRuntime,
    pub mesh: DynMeshControl,
    /// Present only when admin API credentials are configured.
    pub api: Option<ApiClient>,
}

pub type SharedContext = Arc<AppContext>;
