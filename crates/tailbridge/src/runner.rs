use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{self, ApiSyncMethod};
use crate::reconcile::{cleanup_managed_services, pump_events, reconcile_loop, trigger_channel};
use crate::runtime::{DockerRuntime, DynContainerRuntime};
use crate::state::{AppContext, SharedContext};
use crate::tailscale::api::{ApiAuth, ApiClient};
use crate::tailscale::{CliMesh, DynMeshControl};
use crate::telemetry;
use crate::version;

/// Controls optional behaviours when starting the bridge programmatically.
#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Initialize a tracing subscriber before starting the bridge.
    pub init_tracing: bool,
    /// Start the dedicated `/metrics` HTTP server.
    pub serve_metrics: bool,
    /// Reuse an existing Prometheus recorder instead of installing a new one.
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_metrics: true,
            metrics_handle: None,
        }
    }
}

/// Handle returned by [`start_bridge`] to manage shutdown when embedded.
pub struct BridgeHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    ctx: SharedContext,
}

impl BridgeHandle {
    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all bridge tasks to finish, then clear the node's managed
    /// services so nothing keeps advertising dead backends. Cleanup runs even
    /// when a task panicked.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        let mut panicked = false;
        for handle in self.tasks {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    error!(?join_err, "bridge task panicked during shutdown");
                    panicked = true;
                }
            }
        }

        let timeout = Duration::from_secs(self.ctx.cfg.cleanup_timeout_secs);
        let cleanup = cleanup_managed_services(&self.ctx.mesh, self.ctx.api.as_ref());
        if tokio::time::timeout(timeout, cleanup).await.is_err() {
            warn!(
                timeout_secs = self.ctx.cfg.cleanup_timeout_secs,
                "shutdown cleanup timed out"
            );
        }

        if panicked {
            anyhow::bail!("bridge task panicked");
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Start the bridge using the provided configuration and options.
///
/// When embedding into another binary that already set up telemetry, pass
/// `BridgeOptions { init_tracing: false, serve_metrics: false, metrics_handle:
/// Some(existing_handle) }`.
pub async fn start_bridge(
    cfg: config::AppConfig,
    mut options: BridgeOptions,
) -> anyhow::Result<BridgeHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }

    cfg.validate()?;

    let metrics_handle = match options.metrics_handle.take() {
        Some(handle) => telemetry::register_metrics_handle(handle),
        None => telemetry::init_metrics_recorder(),
    };
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;

    let runtime: DynContainerRuntime = Arc::new(DockerRuntime::connect()?);
    let mesh: DynMeshControl = Arc::new(CliMesh::new(
        cfg.tailscale_bin.clone(),
        cfg.tailscale_socket.clone(),
        Duration::from_secs(cfg.cli_timeout_secs),
    ));
    let api = build_api_client(&cfg);

    info!(
        socket = %cfg.tailscale_socket,
        interval_secs = cfg.reconcile_interval_secs,
        tailnet = %cfg.tailnet,
        default_tags = ?cfg.default_tags,
        api_sync = cfg.api_sync_method().label(),
        version = version::VERSION,
        "tailbridge starting"
    );

    let ctx: SharedContext = Arc::new(AppContext {
        cfg,
        runtime,
        mesh,
        api,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics {
        let metrics_handle = metrics_handle.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown_fut)
                    .await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let (trigger_tx, trigger_rx) = trigger_channel();

    let pump_runtime = Arc::clone(&ctx.runtime);
    let pump_shutdown = shutdown_rx.clone();
    let reconnect_base = Duration::from_millis(ctx.cfg.event_reconnect_backoff_ms);
    let reconnect_max = Duration::from_millis(ctx.cfg.event_reconnect_backoff_max_ms);
    tasks.push(tokio::spawn(pump_events(
        pump_runtime,
        trigger_tx,
        pump_shutdown,
        reconnect_base,
        reconnect_max,
    )));

    let loop_ctx = Arc::clone(&ctx);
    let loop_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(reconcile_loop(
        loop_ctx,
        trigger_rx,
        loop_shutdown,
    )));

    Ok(BridgeHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
        ctx,
    })
}

fn build_api_client(cfg: &config::AppConfig) -> Option<ApiClient> {
    match cfg.api_sync_method() {
        ApiSyncMethod::Disabled => None,
        ApiSyncMethod::ApiKey => cfg.api_key.as_ref().map(|key| {
            ApiClient::new(
                cfg.api_base_url.clone(),
                cfg.tailnet.clone(),
                ApiAuth::ApiKey(key.clone()),
            )
        }),
        ApiSyncMethod::OAuth => match (&cfg.oauth_client_id, &cfg.oauth_client_secret) {
            (Some(client_id), Some(client_secret)) => Some(ApiClient::new(
                cfg.api_base_url.clone(),
                cfg.tailnet.clone(),
                ApiAuth::OAuth {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                },
            )),
            _ => None,
        },
    }
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
