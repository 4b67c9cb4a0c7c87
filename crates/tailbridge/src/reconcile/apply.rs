//! Applies a computed diff to the mesh. Deletes run first so a replaced
//! binding never leaves stale state behind, then updates, then creates.
//! Failures are counted per service and never stop the remaining work,
//! except when the mesh itself becomes unreachable.

use std::collections::BTreeMap;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::reconcile::diff::ServiceDiff;
use crate::service::DesiredService;
use crate::tailscale::api::{remove_registry_entry, upsert_registry_entry};
use crate::tailscale::{ApiClient, DynMeshControl, MeshError};
use crate::telemetry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl ApplySummary {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

pub async fn apply_diff(
    mesh: &DynMeshControl,
    api: Option<&ApiClient>,
    desired: &BTreeMap<String, DesiredService>,
    diff: &ServiceDiff,
    shutdown: &watch::Receiver<bool>,
) -> ApplySummary {
    let mut summary = ApplySummary::default();

    for name in &diff.delete {
        if *shutdown.borrow() {
            summary.interrupted = true;
            return summary;
        }
        match mesh.delete_service(name).await {
            Ok(()) => {
                info!(service = %name, "deleted service");
                telemetry::record_service_apply("delete", "ok");
                summary.deleted += 1;
                remove_registry_entry(api, name).await;
            }
            Err(error) => {
                telemetry::record_service_apply("delete", "error");
                warn_apply_failure(name, "delete", &error);
                summary.failed += 1;
                if error.is_unavailable() {
                    return summary;
                }
            }
        }
    }

    for name in &diff.update {
        if *shutdown.borrow() {
            summary.interrupted = true;
            return summary;
        }
        let Some(service) = desired.get(name) else {
            continue;
        };
        match replace_service(mesh, service).await {
            Ok(()) => {
                info!(service = %name, destination = %service.destination(), "updated service");
                telemetry::record_service_apply("update", "ok");
                summary.updated += 1;
                upsert_registry_entry(api, service).await;
            }
            Err(error) => {
                telemetry::record_service_apply("update", "error");
                warn_apply_failure(name, "update", &error);
                summary.failed += 1;
                if error.is_unavailable() {
                    return summary;
                }
            }
        }
    }

    for name in &diff.create {
        if *shutdown.borrow() {
            summary.interrupted = true;
            return summary;
        }
        let Some(service) = desired.get(name) else {
            continue;
        };
        match mesh.apply_service(service).await {
            Ok(()) => {
                info!(service = %name, destination = %service.destination(), "created service");
                telemetry::record_service_apply("create", "ok");
                summary.created += 1;
                upsert_registry_entry(api, service).await;
            }
            Err(error) => {
                telemetry::record_service_apply("create", "error");
                warn_apply_failure(name, "create", &error);
                summary.failed += 1;
                if error.is_unavailable() {
                    return summary;
                }
            }
        }
    }

    summary
}

/// The CLI merges partial configs on write, so an update clears the old
/// config first; otherwise removed ports would survive the overwrite.
async fn replace_service(mesh: &DynMeshControl, service: &DesiredService) -> Result<(), MeshError> {
    mesh.delete_service(&service.qualified_name()).await?;
    mesh.apply_service(service).await
}

fn warn_apply_failure(service: &str, action: &str, error: &MeshError) {
    match error {
        MeshError::ConfigConflict { .. } => warn!(
            service,
            action,
            %error,
            "apply failed; remove the conflicting serve config or move the service port"
        ),
        MeshError::UntaggedNode { .. } => warn!(
            service,
            action,
            %error,
            "apply failed; tag this node so it can host services"
        ),
        _ => warn!(service, action, %error, "apply failed"),
    }
}
