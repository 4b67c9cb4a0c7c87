//! Container runtime abstraction. The daemon only needs three things from
//! the runtime: the labeled containers currently running, the wiring detail
//! of one container, and a stream of lifecycle events.

pub mod docker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum ContainerRuntimeError {
    #[error("failed to connect to container runtime ({context}): {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to list containers: {0}")]
    ListContainers(#[source] anyhow::Error),
    #[error("failed to inspect container {id}: {source}")]
    InspectContainer {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("container event stream failed: {0}")]
    EventStream(#[source] anyhow::Error),
    #[error("container {id} not found")]
    NotFound { id: String },
}

impl ContainerRuntimeError {
    /// True when the runtime socket itself is unreachable, as opposed to a
    /// request failing. Callers treat this as "skip the pass and retry".
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// A running container that opted in via the enable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

impl EnabledContainer {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// First 12 characters of a container id, the form Docker prints.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Wiring detail of one container, as needed for destination resolution.
/// Map keys and ordering are normalized so resolution is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspection {
    pub id: String,
    pub name: String,
    pub network_mode: Option<String>,
    /// Network name to container IP; entries without an address keep an
    /// empty string.
    pub networks: BTreeMap<String, String>,
    /// Requested bindings from the host config, keyed `"8080/tcp"`.
    pub port_bindings: BTreeMap<String, Vec<String>>,
    /// Effective bindings from the network settings, same key shape.
    pub published_ports: BTreeMap<String, Vec<String>>,
}

impl ContainerInspection {
    pub fn is_host_network(&self) -> bool {
        self.network_mode.as_deref() == Some("host")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Die,
    Restart,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Die => "die",
            Self::Restart => "restart",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "die" => Some(Self::Die),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }
}

/// A container state change worth reconciling over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub action: EventAction,
    pub container_id: String,
    pub container_name: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers carrying the enable label. Filtering happens
    /// runtime-side where possible.
    async fn list_enabled_containers(&self) -> Result<Vec<EnabledContainer>, ContainerRuntimeError>;

    async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerInspection, ContainerRuntimeError>;

    /// Forwards lifecycle events into `events` until the stream ends or the
    /// receiver is dropped (both `Ok`), or the stream fails (`Err`). The
    /// caller owns reconnection.
    async fn watch_lifecycle_events(
        &self,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Result<(), ContainerRuntimeError>;
}

pub type DynContainerRuntime = Arc<dyn ContainerRuntime>;
