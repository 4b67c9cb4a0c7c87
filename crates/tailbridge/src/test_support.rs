use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::reconcile::diff::{ManagedServiceRecord, TcpMode, expected_record};
use crate::runtime::{
    ContainerInspection, ContainerRuntime, ContainerRuntimeError, EnabledContainer, LifecycleEvent,
};
use crate::service::DesiredService;
use crate::state::{AppContext, SharedContext};
use crate::tailscale::status::{Handler, ServiceConfig, TcpPortConfig, WebConfig};
use crate::tailscale::{FunnelStatus, MeshControl, MeshError, ServeStatus};

pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        // Long enough that only the immediate startup tick fires in tests.
        reconcile_interval_secs: 3600,
        cleanup_timeout_secs: 5,
        tailscale_bin: "tailscale".into(),
        tailscale_socket: "/var/run/tailscale/tailscaled.sock".into(),
        cli_timeout_secs: 5,
        default_tags: vec!["tag:container".into()],
        probe_timeout_ms: 10,
        event_reconnect_backoff_ms: 10,
        event_reconnect_backoff_max_ms: 50,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        api_base_url: "https://api.tailscale.com".into(),
        tailnet: "-".into(),
        api_key: None,
        oauth_client_id: None,
        oauth_client_secret: None,
    }
}

pub(crate) fn test_context(runtime: Arc<MockRuntime>, mesh: Arc<MockMesh>) -> SharedContext {
    Arc::new(AppContext {
        cfg: test_config(),
        runtime,
        mesh,
        api: None,
    })
}

#[derive(Default)]
pub(crate) struct MockRuntime {
    pub(crate) containers: Mutex<Vec<EnabledContainer>>,
    pub(crate) inspections: Mutex<HashMap<String, ContainerInspection>>,
    pub(crate) list_connection_error: AtomicBool,
    /// Events delivered on the next watch call; the stream then stays open.
    pub(crate) events: Mutex<Vec<LifecycleEvent>>,
    pub(crate) watch_error: AtomicBool,
    pub(crate) watch_calls: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_enabled_containers(&self) -> Result<Vec<EnabledContainer>, ContainerRuntimeError> {
        if self.list_connection_error.load(Ordering::SeqCst) {
            return Err(ContainerRuntimeError::Connection {
                context: "list containers",
                source: anyhow::anyhow!("test-only connection failure"),
            });
        }
        Ok(self.containers.lock().expect("lock").clone())
    }

    async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerInspection, ContainerRuntimeError> {
        self.inspections
            .lock()
            .expect("lock")
            .get(id)
            .cloned()
            .ok_or(ContainerRuntimeError::NotFound { id: id.to_string() })
    }

    async fn watch_lifecycle_events(
        &self,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Result<(), ContainerRuntimeError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.watch_error.load(Ordering::SeqCst) {
            return Err(ContainerRuntimeError::EventStream(anyhow::anyhow!(
                "test-only stream failure"
            )));
        }

        let pending: Vec<LifecycleEvent> = {
            let mut queued = self.events.lock().expect("lock");
            queued.drain(..).collect()
        };
        for event in pending {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        std::future::pending::<()>().await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MeshOp {
    ServeStatus,
    FunnelStatus,
    Apply(String),
    Delete(String),
}

/// Mesh fake that stores applied services as the records the status
/// projection would read back, so reconcile tests exercise the real diff.
#[derive(Default)]
pub(crate) struct MockMesh {
    pub(crate) records: Mutex<BTreeMap<String, ManagedServiceRecord>>,
    pub(crate) ops: Mutex<Vec<MeshOp>>,
    pub(crate) fail_apply: Mutex<HashSet<String>>,
    pub(crate) fail_delete: Mutex<HashSet<String>>,
    pub(crate) fail_status: AtomicBool,
}

impl MockMesh {
    /// Stores the record `service` would leave on the node once applied.
    pub(crate) fn seed(&self, qualified_name: &str, service: &DesiredService) {
        self.records
            .lock()
            .expect("lock")
            .insert(qualified_name.to_string(), expected_record(service));
    }

    fn statuses(&self) -> (ServeStatus, FunnelStatus) {
        let mut serve = ServeStatus::default();
        let mut funnel = FunnelStatus::default();

        for (name, record) in self.records.lock().expect("lock").iter() {
            let mut config = ServiceConfig::default();
            for (port, mode) in &record.tcp {
                config.tcp.insert(
                    port.to_string(),
                    TcpPortConfig {
                        http: *mode == TcpMode::Http,
                        https: *mode == TcpMode::Https,
                    },
                );
            }
            let host = name.strip_prefix("svc:").unwrap_or(name);
            for (port, proxy) in &record.proxies {
                config.web.insert(
                    format!("{host}.test.ts.net:{port}"),
                    WebConfig {
                        handlers: HashMap::from([(
                            "/".to_string(),
                            Handler {
                                proxy: proxy.clone(),
                            },
                        )]),
                    },
                );
            }
            serve.services.insert(name.clone(), config);

            for port in &record.funnel {
                funnel.allow_funnel.insert(format!("{name}:{port}"), true);
            }
        }

        (serve, funnel)
    }

    fn unavailable(command: &str) -> MeshError {
        MeshError::Launch {
            command: command.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "test-only socket failure",
            ),
        }
    }
}

#[async_trait]
impl MeshControl for MockMesh {
    async fn serve_status(&self) -> Result<ServeStatus, MeshError> {
        self.ops.lock().expect("lock").push(MeshOp::ServeStatus);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::unavailable("serve status"));
        }
        Ok(self.statuses().0)
    }

    async fn funnel_status(&self) -> Result<FunnelStatus, MeshError> {
        self.ops.lock().expect("lock").push(MeshOp::FunnelStatus);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::unavailable("funnel status"));
        }
        Ok(self.statuses().1)
    }

    async fn apply_service(&self, service: &DesiredService) -> Result<(), MeshError> {
        let name = service.qualified_name();
        self.ops
            .lock()
            .expect("lock")
            .push(MeshOp::Apply(name.clone()));
        if self.fail_apply.lock().expect("lock").contains(&name) {
            return Err(MeshError::CommandFailed {
                command: "serve".to_string(),
                detail: format!("injected failure for {name}"),
            });
        }
        self.records
            .lock()
            .expect("lock")
            .insert(name, expected_record(service));
        Ok(())
    }

    async fn delete_service(&self, qualified_name: &str) -> Result<(), MeshError> {
        self.ops
            .lock()
            .expect("lock")
            .push(MeshOp::Delete(qualified_name.to_string()));
        if self.fail_delete.lock().expect("lock").contains(qualified_name) {
            return Err(MeshError::CommandFailed {
                command: "serve".to_string(),
                detail: format!("injected failure for {qualified_name}"),
            });
        }
        self.records.lock().expect("lock").remove(qualified_name);
        Ok(())
    }
}

#[tokio::test]
async fn mock_mesh_records_round_trip_through_the_status_projection() {
    use crate::reconcile::diff::managed_records;
    use crate::service::{BackendProtocol, FunnelProtocol, FunnelSpec, ServiceProtocol};

    let service = DesiredService {
        container_id: "0123456789ab".to_string(),
        container_name: "web-1".to_string(),
        name: "web".to_string(),
        backend_protocol: BackendProtocol::Http,
        service_protocol: ServiceProtocol::Https,
        service_port: 443,
        dest_addr: "172.18.0.5".to_string(),
        dest_port: 8080,
        tags: vec!["tag:container".to_string()],
        funnel: Some(FunnelSpec {
            public_port: 8443,
            protocol: FunnelProtocol::Https,
            target_port: 9090,
            dest_port: 9090,
        }),
    };

    let mesh = MockMesh::default();
    mesh.apply_service(&service).await.expect("apply");

    let serve = mesh.serve_status().await.expect("serve status");
    let funnel = mesh.funnel_status().await.expect("funnel status");
    let projected = managed_records(&serve, &funnel);

    assert_eq!(projected, mesh.records.lock().expect("lock").clone());
}
