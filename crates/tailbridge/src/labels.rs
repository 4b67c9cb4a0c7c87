//! The closed set of container labels tailbridge understands.
//!
//! Everything under `tailbridge.service.*` describes the private mesh
//! exposure; `tailbridge.funnel.*` optionally layers public ingress on top.
//! Unknown labels in either namespace are ignored.

use std::collections::HashMap;

/// Opt-in flag; only the literal string `"true"` enables a container.
pub const ENABLE: &str = "tailbridge.service.enable";
/// Mesh-facing service name, unique per host. Required when enabled.
pub const NAME: &str = "tailbridge.service.name";
/// Container port traffic is forwarded to. Required when enabled.
pub const TARGET_PORT: &str = "tailbridge.service.target-port";
/// Protocol spoken by the container backend.
pub const TARGET_PROTOCOL: &str = "tailbridge.service.target-protocol";
/// Mesh-facing service port.
pub const PORT: &str = "tailbridge.service.port";
/// Mesh-facing service protocol.
pub const PROTOCOL: &str = "tailbridge.service.protocol";
/// Comma-separated access-control tags.
pub const TAGS: &str = "tailbridge.service.tags";
/// Set to `"false"` to proxy via a published host port instead of the
/// container's own address.
pub const DIRECT: &str = "tailbridge.service.direct";
/// Explicit Docker network to resolve the container address on.
pub const NETWORK: &str = "tailbridge.service.network";

/// Funnel opt-in flag; only the literal string `"true"` enables it.
pub const FUNNEL_ENABLE: &str = "tailbridge.funnel.enable";
/// Container port the funnel forwards to. Required when funnel is enabled.
pub const FUNNEL_TARGET_PORT: &str = "tailbridge.funnel.target-port";
/// Public-facing funnel protocol.
pub const FUNNEL_PROTOCOL: &str = "tailbridge.funnel.protocol";
/// Public-facing funnel port.
pub const FUNNEL_PORT: &str = "tailbridge.funnel.port";

/// Returns the label value trimmed, or `None` when absent or blank.
pub fn get<'a>(labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    labels
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Whether a flag label is set to the literal string `"true"`.
pub fn is_true(labels: &HashMap<String, String>, key: &str) -> bool {
    get(labels, key) == Some("true")
}
