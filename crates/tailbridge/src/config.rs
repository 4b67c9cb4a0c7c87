use serde::Deserialize;
use std::env;

pub const ENV_PREFIX: &str = "TAILBRIDGE";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Seconds between periodic reconcile passes.
    pub reconcile_interval_secs: u64,
    /// Ceiling for the shutdown cleanup, so a hung CLI cannot block exit.
    pub cleanup_timeout_secs: u64,
    /// Mesh CLI binary; resolved via PATH unless absolute.
    pub tailscale_bin: String,
    /// Local daemon socket passed to every CLI call.
    pub tailscale_socket: String,
    /// Per-invocation CLI timeout.
    pub cli_timeout_secs: u64,
    /// Tags for services whose containers set none.
    pub default_tags: Vec<String>,
    /// Backend TCP probe timeout in direct mode.
    pub probe_timeout_ms: u64,
    pub event_reconnect_backoff_ms: u64,
    pub event_reconnect_backoff_max_ms: u64,
    pub metrics_host: String,
    pub metrics_port: u16,
    /// Admin API endpoint; only used when credentials are set.
    pub api_base_url: String,
    /// Tailnet name for admin API paths; `-` means the key's default tailnet.
    pub tailnet: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub oauth_client_id: Option<String>,
    #[serde(default)]
    pub oauth_client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiSyncMethod {
    Disabled,
    ApiKey,
    OAuth,
}

impl ApiSyncMethod {
    pub fn label(&self) -> &'static str {
        match self {
            ApiSyncMethod::Disabled => "disabled",
            ApiSyncMethod::ApiKey => "api_key",
            ApiSyncMethod::OAuth => "oauth",
        }
    }
}

impl AppConfig {
    pub fn api_sync_method(&self) -> ApiSyncMethod {
        if self.api_key.is_some() {
            ApiSyncMethod::ApiKey
        } else if self.oauth_client_id.is_some() && self.oauth_client_secret.is_some() {
            ApiSyncMethod::OAuth
        } else {
            ApiSyncMethod::Disabled
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("reconcile_interval_secs must be > 0");
        }
        if self.cli_timeout_secs == 0 {
            anyhow::bail!("cli_timeout_secs must be > 0");
        }
        if self.cleanup_timeout_secs == 0 {
            anyhow::bail!("cleanup_timeout_secs must be > 0");
        }
        if self.tailscale_bin.trim().is_empty() {
            anyhow::bail!("tailscale_bin cannot be empty");
        }
        if self.tailscale_socket.trim().is_empty() {
            anyhow::bail!("tailscale_socket cannot be empty");
        }
        if self.event_reconnect_backoff_ms == 0 {
            anyhow::bail!("event_reconnect_backoff_ms must be > 0");
        }
        if self.event_reconnect_backoff_max_ms < self.event_reconnect_backoff_ms {
            anyhow::bail!("event_reconnect_backoff_max_ms must be >= event_reconnect_backoff_ms");
        }
        if self.oauth_client_id.is_some() != self.oauth_client_secret.is_some() {
            anyhow::bail!("oauth_client_id and oauth_client_secret must be set together");
        }
        if self.api_key.is_some() && self.oauth_client_id.is_some() {
            anyhow::bail!("set either api_key or the oauth client pair, not both");
        }
        Ok(())
    }
}

enum EnvKind {
    String,
    List,
}

// (ENV_NAME, config_key, kind)
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    (
        "TAILBRIDGE_RECONCILE_INTERVAL_SECS",
        "reconcile_interval_secs",
        EnvKind::String,
    ),
    (
        "TAILBRIDGE_CLEANUP_TIMEOUT_SECS",
        "cleanup_timeout_secs",
        EnvKind::String,
    ),
    ("TAILBRIDGE_TAILSCALE_BIN", "tailscale_bin", EnvKind::String),
    (
        "TAILBRIDGE_TAILSCALE_SOCKET",
        "tailscale_socket",
        EnvKind::String,
    ),
    (
        "TAILBRIDGE_CLI_TIMEOUT_SECS",
        "cli_timeout_secs",
        EnvKind::String,
    ),
    ("TAILBRIDGE_DEFAULT_TAGS", "default_tags", EnvKind::List),
    (
        "TAILBRIDGE_PROBE_TIMEOUT_MS",
        "probe_timeout_ms",
        EnvKind::String,
    ),
    (
        "TAILBRIDGE_EVENT_RECONNECT_BACKOFF_MS",
        "event_reconnect_backoff_ms",
        EnvKind::String,
    ),
    (
        "TAILBRIDGE_EVENT_RECONNECT_BACKOFF_MAX_MS",
        "event_reconnect_backoff_max_ms",
        EnvKind::String,
    ),
    ("TAILBRIDGE_METRICS_HOST", "metrics_host", EnvKind::String),
    ("TAILBRIDGE_METRICS_PORT", "metrics_port", EnvKind::String),
    ("TAILBRIDGE_API_BASE_URL", "api_base_url", EnvKind::String),
    ("TAILBRIDGE_TAILNET", "tailnet", EnvKind::String),
    ("TAILBRIDGE_API_KEY", "api_key", EnvKind::String),
    (
        "TAILBRIDGE_OAUTH_CLIENT_ID",
        "oauth_client_id",
        EnvKind::String,
    ),
    (
        "TAILBRIDGE_OAUTH_CLIENT_SECRET",
        "oauth_client_secret",
        EnvKind::String,
    ),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .set_default("reconcile_interval_secs", 60)?
        .set_default("cleanup_timeout_secs", 30)?
        .set_default("tailscale_bin", "tailscale")?
        .set_default("tailscale_socket", "/var/run/tailscale/tailscaled.sock")?
        .set_default("cli_timeout_secs", 30)?
        .set_default("default_tags", vec!["tag:container"])?
        .set_default("probe_timeout_ms", 1_000)?
        .set_default("event_reconnect_backoff_ms", 500)?
        .set_default("event_reconnect_backoff_max_ms", 10_000)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9105)?
        .set_default("api_base_url", "https://api.tailscale.com")?
        .set_default("tailnet", "-")?
        .set_default("api_key", Option::<String>::None)?
        .set_default("oauth_client_id", Option::<String>::None)?
        .set_default("oauth_client_secret", Option::<String>::None)?;

    // Override with single-underscore environment variables.
    for (env_key, cfg_key, kind) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            match kind {
                EnvKind::List => {
                    let entries: Vec<String> = value
                        .split(',')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                    builder = builder.set_override(cfg_key, entries)?;
                }
                EnvKind::String => {
                    builder = builder.set_override(cfg_key, value)?;
                }
            }
        }
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
