//! Wire shapes of `serve status --json` and `funnel status --json`. Every
//! field defaults so partial output decodes to an empty config instead of
//! failing the pass.

use std::collections::HashMap;

use serde::Deserialize;

/// Output of `serve status --json`, reduced to the per-service configs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServeStatus {
    #[serde(default, rename = "Services")]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceConfig {
    /// TCP bindings keyed by the decimal service port.
    #[serde(default, rename = "TCP")]
    pub tcp: HashMap<String, TcpPortConfig>,
    /// Web handlers keyed `<host>:<port>`; only the port suffix matters here.
    #[serde(default, rename = "Web")]
    pub web: HashMap<String, WebConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TcpPortConfig {
    #[serde(default, rename = "HTTP")]
    pub http: bool,
    #[serde(default, rename = "HTTPS")]
    pub https: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WebConfig {
    #[serde(default, rename = "Handlers")]
    pub handlers: HashMap<String, Handler>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Handler {
    #[serde(default, rename = "Proxy")]
    pub proxy: String,
}

/// Output of `funnel status --json`, reduced to the funnel permission map
/// keyed `svc:<name>:<port>`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunnelStatus {
    #[serde(default, rename = "AllowFunnel")]
    pub allow_funnel: HashMap<String, bool>,
}
