//! Desired-state model: one [`DesiredService`] per enabled container,
//! rebuilt from scratch on every reconciliation pass and discarded after it.

use std::fmt;

/// Reserved prefix marking a mesh service as created and owned by tailbridge.
/// Entries without it are invisible to diffing and are never touched.
pub const SERVICE_NAME_PREFIX: &str = "svc:";

/// Whether a mesh-side service name is owned by this daemon.
pub fn is_managed_name(name: &str) -> bool {
    name.starts_with(SERVICE_NAME_PREFIX)
}

/// Protocol spoken by the container backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProtocol {
    Http,
    Https,
    HttpsInsecure,
    Tcp,
    TlsTerminatedTcp,
}

impl BackendProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "https+insecure" => Some(Self::HttpsInsecure),
            "tcp" => Some(Self::Tcp),
            "tls-terminated-tcp" => Some(Self::TlsTerminatedTcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::HttpsInsecure => "https+insecure",
            Self::Tcp => "tcp",
            Self::TlsTerminatedTcp => "tls-terminated-tcp",
        }
    }

    /// TCP-class backends carry their protocol through to the service side
    /// instead of defaulting to HTTP.
    pub fn is_tcp_class(&self) -> bool {
        matches!(self, Self::Tcp | Self::TlsTerminatedTcp)
    }

    pub fn is_https_class(&self) -> bool {
        matches!(self, Self::Https | Self::HttpsInsecure)
    }

    /// The service-side protocol this backend maps to when mirrored.
    pub fn service_equivalent(&self) -> ServiceProtocol {
        match self {
            Self::Http => ServiceProtocol::Http,
            Self::Https | Self::HttpsInsecure => ServiceProtocol::Https,
            Self::Tcp => ServiceProtocol::Tcp,
            Self::TlsTerminatedTcp => ServiceProtocol::TlsTerminatedTcp,
        }
    }
}

impl fmt::Display for BackendProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mesh-facing service protocol. Narrower than [`BackendProtocol`]: the
/// insecure-HTTPS variant only makes sense toward a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProtocol {
    Http,
    Https,
    Tcp,
    TlsTerminatedTcp,
}

impl ServiceProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "tcp" => Some(Self::Tcp),
            "tls-terminated-tcp" => Some(Self::TlsTerminatedTcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
            Self::TlsTerminatedTcp => "tls-terminated-tcp",
        }
    }

    pub fn is_web(&self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

impl fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public-facing funnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelProtocol {
    Https,
    Tcp,
    TlsTerminatedTcp,
}

impl FunnelProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "https" => Some(Self::Https),
            "tcp" => Some(Self::Tcp),
            "tls-terminated-tcp" => Some(Self::TlsTerminatedTcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Tcp => "tcp",
            Self::TlsTerminatedTcp => "tls-terminated-tcp",
        }
    }
}

impl fmt::Display for FunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public ingress layered on top of a service's mesh exposure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunnelSpec {
    /// Port exposed on the public internet.
    pub public_port: u16,
    pub protocol: FunnelProtocol,
    /// Container port the funnel forwards to.
    pub target_port: u16,
    /// Resolved destination port (differs from `target_port` in
    /// published-port mode).
    pub dest_port: u16,
}

/// One exposure intent, derived fresh each pass from a container's labels and
/// inspection data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredService {
    /// Short container id, for logs and the admin API comment.
    pub container_id: String,
    pub container_name: String,
    /// Bare service name from the label, without the reserved prefix.
    pub name: String,
    pub backend_protocol: BackendProtocol,
    pub service_protocol: ServiceProtocol,
    pub service_port: u16,
    /// Resolved address traffic is proxied to.
    pub dest_addr: String,
    pub dest_port: u16,
    pub tags: Vec<String>,
    pub funnel: Option<FunnelSpec>,
}

impl DesiredService {
    /// Mesh-side name including the reserved ownership prefix.
    pub fn qualified_name(&self) -> String {
        format!("{SERVICE_NAME_PREFIX}{}", self.name)
    }

    /// Destination URI for the main backend.
    pub fn destination(&self) -> String {
        build_destination(self.backend_protocol.as_str(), &self.dest_addr, self.dest_port)
    }

    /// Destination URI for the funnel backend. The funnel forwards to the same
    /// container, so it reuses the backend protocol with its own port.
    pub fn funnel_destination(&self) -> Option<String> {
        self.funnel.as_ref().map(|funnel| {
            build_destination(self.backend_protocol.as_str(), &self.dest_addr, funnel.dest_port)
        })
    }
}

/// Builds `protocol://address:port`, the scheme name identical for every
/// supported backend protocol including the insecure-HTTPS variant.
pub fn build_destination(protocol: &str, addr: &str, port: u16) -> String {
    format!("{protocol}://{addr}:{port}")
}
