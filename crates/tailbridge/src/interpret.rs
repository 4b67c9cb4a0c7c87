//! Label interpretation: turns a container's label map into a validated
//! [`ServiceIntent`], or a rejection reason. Pure apart from diagnostic
//! logging; inspection data is handled separately by the resolver.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

use crate::labels;
use crate::service::{BackendProtocol, FunnelProtocol, ServiceProtocol};

const BACKEND_PROTOCOLS: &str = "http, https, https+insecure, tcp, tls-terminated-tcp";
const SERVICE_PROTOCOLS: &str = "http, https, tcp, tls-terminated-tcp";
const FUNNEL_PROTOCOLS: &str = "https, tcp, tls-terminated-tcp";

/// Public ports an HTTPS funnel may use. TCP funnels are not restricted.
const FUNNEL_ALLOWED_PORTS: [u16; 3] = [443, 8443, 10000];

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("missing required label: {label}")]
    MissingLabel { label: &'static str },
    #[error("invalid protocol {value:?} for {label} (valid: {valid})")]
    InvalidProtocol {
        label: &'static str,
        value: String,
        valid: &'static str,
    },
    #[error("invalid port {value:?} for {label}")]
    InvalidPort { label: &'static str, value: String },
    #[error("invalid funnel port {port} for HTTPS funnels (allowed: 443, 8443, 10000)")]
    InvalidFunnelPort { port: u16 },
}

/// What the labels ask for, before any destination resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIntent {
    pub name: String,
    /// Container port the mesh forwards to.
    pub target_port: u16,
    pub backend_protocol: BackendProtocol,
    pub service_port: u16,
    pub service_protocol: ServiceProtocol,
    pub tags: Vec<String>,
    /// False when the direct label is the literal `"false"`.
    pub direct: bool,
    pub network: Option<String>,
    pub funnel: Option<FunnelIntent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunnelIntent {
    /// Container port the funnel forwards to.
    pub target_port: u16,
    pub protocol: FunnelProtocol,
    pub public_port: u16,
}

/// Interprets a container's labels. `Ok(None)` means the container is not
/// participating; errors reject this container only, never the whole pass.
/// `container` is a display name used in diagnostics.
pub fn interpret(
    container: &str,
    label_map: &HashMap<String, String>,
    default_tags: &[String],
) -> Result<Option<ServiceIntent>, LabelError> {
    if !labels::is_true(label_map, labels::ENABLE) {
        return Ok(None);
    }

    let name = labels::get(label_map, labels::NAME)
        .ok_or(LabelError::MissingLabel {
            label: labels::NAME,
        })?
        .to_string();
    let target_port = labels::get(label_map, labels::TARGET_PORT)
        .ok_or(LabelError::MissingLabel {
            label: labels::TARGET_PORT,
        })
        .and_then(|raw| parse_port(labels::TARGET_PORT, raw))?;

    let backend_protocol = match labels::get(label_map, labels::TARGET_PROTOCOL) {
        Some(raw) => {
            BackendProtocol::parse(raw).ok_or_else(|| LabelError::InvalidProtocol {
                label: labels::TARGET_PROTOCOL,
                value: raw.to_string(),
                valid: BACKEND_PROTOCOLS,
            })?
        }
        None if target_port == 443 => BackendProtocol::Https,
        None => BackendProtocol::Http,
    };

    let service_port = labels::get(label_map, labels::PORT)
        .map(|raw| parse_port(labels::PORT, raw))
        .transpose()?;
    let service_protocol = labels::get(label_map, labels::PROTOCOL)
        .map(|raw| {
            ServiceProtocol::parse(raw).ok_or_else(|| LabelError::InvalidProtocol {
                label: labels::PROTOCOL,
                value: raw.to_string(),
                valid: SERVICE_PROTOCOLS,
            })
        })
        .transpose()?;
    let binding = service_binding(service_port, service_protocol, backend_protocol);

    let tags = parse_tags(
        container,
        labels::get(label_map, labels::TAGS),
        default_tags,
    );
    let direct = labels::get(label_map, labels::DIRECT) != Some("false");
    let network = labels::get(label_map, labels::NETWORK).map(String::from);
    let funnel = parse_funnel(label_map)?;

    Ok(Some(ServiceIntent {
        name,
        target_port,
        backend_protocol,
        service_port: binding.port,
        service_protocol: binding.protocol,
        tags,
        direct,
        network,
        funnel,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ServiceBinding {
    port: u16,
    protocol: ServiceProtocol,
}

/// Joint service port/protocol defaulting. Backend-protocol awareness wins
/// over naive port-based defaulting: a TCP-class backend never silently
/// becomes an HTTP service, and an HTTPS backend defaults to an HTTPS service.
fn service_binding(
    port: Option<u16>,
    protocol: Option<ServiceProtocol>,
    backend: BackendProtocol,
) -> ServiceBinding {
    match (port, protocol) {
        (None, None) => both_unset(backend),
        (None, Some(protocol)) => port_from_protocol(protocol),
        (Some(port), None) => protocol_from_port(port, backend),
        (Some(port), Some(protocol)) => ServiceBinding { port, protocol },
    }
}

fn both_unset(backend: BackendProtocol) -> ServiceBinding {
    if backend.is_tcp_class() {
        ServiceBinding {
            port: 80,
            protocol: backend.service_equivalent(),
        }
    } else if backend.is_https_class() {
        ServiceBinding {
            port: 443,
            protocol: ServiceProtocol::Https,
        }
    } else {
        ServiceBinding {
            port: 80,
            protocol: ServiceProtocol::Http,
        }
    }
}

fn port_from_protocol(protocol: ServiceProtocol) -> ServiceBinding {
    let port = match protocol {
        ServiceProtocol::Https => 443,
        _ => 80,
    };
    ServiceBinding { port, protocol }
}

fn protocol_from_port(port: u16, backend: BackendProtocol) -> ServiceBinding {
    let protocol = if backend.is_tcp_class() {
        backend.service_equivalent()
    } else {
        match port {
            443 => ServiceProtocol::Https,
            _ => ServiceProtocol::Http,
        }
    };
    ServiceBinding { port, protocol }
}

fn parse_port(label: &'static str, value: &str) -> Result<u16, LabelError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| LabelError::InvalidPort {
            label,
            value: value.to_string(),
        })
}

/// Comma-split, trimmed, empties dropped; defaults apply only when the label
/// is absent. Tags without the `tag:` prefix are kept but flagged, since the
/// tailnet policy will usually reject them.
fn parse_tags(container: &str, raw: Option<&str>, default_tags: &[String]) -> Vec<String> {
    let Some(raw) = raw else {
        return default_tags.to_vec();
    };

    let tags: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect();
    for tag in &tags {
        if !tag.starts_with("tag:") {
            warn!(container, tag, "tag does not carry the tag: prefix");
        }
    }
    tags
}

fn parse_funnel(label_map: &HashMap<String, String>) -> Result<Option<FunnelIntent>, LabelError> {
    if !labels::is_true(label_map, labels::FUNNEL_ENABLE) {
        return Ok(None);
    }

    let target_port = labels::get(label_map, labels::FUNNEL_TARGET_PORT)
        .ok_or(LabelError::MissingLabel {
            label: labels::FUNNEL_TARGET_PORT,
        })
        .and_then(|raw| parse_port(labels::FUNNEL_TARGET_PORT, raw))?;

    let protocol = match labels::get(label_map, labels::FUNNEL_PROTOCOL) {
        Some(raw) => FunnelProtocol::parse(raw).ok_or_else(|| LabelError::InvalidProtocol {
            label: labels::FUNNEL_PROTOCOL,
            value: raw.to_string(),
            valid: FUNNEL_PROTOCOLS,
        })?,
        None => FunnelProtocol::Https,
    };

    let public_port = labels::get(label_map, labels::FUNNEL_PORT)
        .map(|raw| parse_port(labels::FUNNEL_PORT, raw))
        .transpose()?
        .unwrap_or(443);

    if protocol == FunnelProtocol::Https && !FUNNEL_ALLOWED_PORTS.contains(&public_port) {
        return Err(LabelError::InvalidFunnelPort { port: public_port });
    }

    Ok(Some(FunnelIntent {
        target_port,
        protocol,
        public_port,
    }))
}
