//! Destination resolution: picks the address the mesh proxy should dial for
//! a container port, based on how the container is networked.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::runtime::ContainerInspection;

/// Address used when the backend is reachable through the node itself.
const LOOPBACK: &str = "localhost";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("container {container} has no network with an address")]
    NoNetworkAttachment { container: String },
    #[error("container {container} is not attached to network {requested:?} (attached: {attached:?})")]
    NetworkNotFound {
        container: String,
        requested: String,
        attached: Vec<String>,
    },
    #[error("container {container} does not publish port {port}/tcp (published: {published:?})")]
    PortNotPublished {
        container: String,
        port: u16,
        published: Vec<String>,
    },
}

/// Where the proxy should connect for one container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionMode {
    /// Host-networked container: the backend sits on the node's loopback.
    HostNetwork,
    /// Dial the container IP on one of its attached networks.
    Direct { network: Option<String> },
    /// Dial the host port the container publishes.
    Published,
}

pub fn resolution_mode(
    inspection: &ContainerInspection,
    direct: bool,
    network: Option<&str>,
) -> ResolutionMode {
    if inspection.is_host_network() {
        ResolutionMode::HostNetwork
    } else if direct {
        ResolutionMode::Direct {
            network: network.map(String::from),
        }
    } else {
        ResolutionMode::Published
    }
}

/// Resolves one container port to a dialable destination. In direct mode the
/// destination is probed with a short TCP connect; the result is diagnostic
/// only and never fails resolution.
pub async fn resolve_destination(
    inspection: &ContainerInspection,
    mode: &ResolutionMode,
    port: u16,
    probe_timeout: Duration,
) -> Result<Destination, ResolveError> {
    match mode {
        ResolutionMode::HostNetwork => Ok(Destination {
            addr: LOOPBACK.to_string(),
            port,
        }),
        ResolutionMode::Direct { network } => {
            let (network, addr) = select_network(inspection, network.as_deref())?;
            let destination = Destination { addr, port };
            probe_backend(&inspection.name, &network, &destination, probe_timeout).await;
            Ok(destination)
        }
        ResolutionMode::Published => {
            let host_port = published_port(inspection, port)?;
            Ok(Destination {
                addr: LOOPBACK.to_string(),
                port: host_port,
            })
        }
    }
}

/// Network precedence when no network is requested: `bridge`, then the first
/// attachment with an address in name order. A requested network matches
/// exactly or as a compose-style `<project>_<name>` suffix.
fn select_network(
    inspection: &ContainerInspection,
    requested: Option<&str>,
) -> Result<(String, String), ResolveError> {
    let attached: Vec<(&String, &String)> = inspection
        .networks
        .iter()
        .filter(|(_, addr)| !addr.is_empty())
        .collect();

    if let Some(requested) = requested {
        if let Some((name, addr)) = attached.iter().find(|(name, _)| name.as_str() == requested) {
            return Ok(((*name).clone(), (*addr).clone()));
        }
        let suffix = format!("_{requested}");
        if let Some((name, addr)) = attached.iter().find(|(name, _)| name.ends_with(&suffix)) {
            return Ok(((*name).clone(), (*addr).clone()));
        }
        return Err(ResolveError::NetworkNotFound {
            container: inspection.name.clone(),
            requested: requested.to_string(),
            attached: inspection.networks.keys().cloned().collect(),
        });
    }

    if let Some((name, addr)) = attached.iter().find(|(name, _)| name.as_str() == "bridge") {
        return Ok(((*name).clone(), (*addr).clone()));
    }
    match attached.first() {
        Some((name, addr)) => Ok(((*name).clone(), (*addr).clone())),
        None => Err(ResolveError::NoNetworkAttachment {
            container: inspection.name.clone(),
        }),
    }
}

/// Host port for `port/tcp`, preferring the requested bindings and falling
/// back to the effective ones. Non-numeric host ports are skipped.
fn published_port(inspection: &ContainerInspection, port: u16) -> Result<u16, ResolveError> {
    let key = format!("{port}/tcp");
    let host_port = [&inspection.port_bindings, &inspection.published_ports]
        .into_iter()
        .filter_map(|bindings| bindings.get(&key))
        .flatten()
        .find_map(|raw| raw.parse::<u16>().ok());

    host_port.ok_or_else(|| {
        let mut published: Vec<String> = inspection
            .port_bindings
            .keys()
            .chain(inspection.published_ports.keys())
            .cloned()
            .collect();
        published.sort();
        published.dedup();
        ResolveError::PortNotPublished {
            container: inspection.name.clone(),
            port,
            published,
        }
    })
}

async fn probe_backend(
    container: &str,
    network: &str,
    destination: &Destination,
    timeout: Duration,
) {
    let addr = format!("{}:{}", destination.addr, destination.port);
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => debug!(container, network, addr, "backend probe connected"),
        Ok(Err(error)) => debug!(container, network, addr, %error, "backend probe failed"),
        Err(_) => debug!(
            container,
            network,
            addr,
            timeout_ms = timeout.as_millis() as u64,
            "backend probe timed out"
        ),
    }
}
