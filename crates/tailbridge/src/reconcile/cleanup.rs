//! Shutdown cleanup: removes every managed service from the node so nothing
//! keeps advertising backends that are about to disappear with the daemon.

use tracing::{info, warn};

use crate::reconcile::diff::managed_records;
use crate::tailscale::api::remove_registry_entry;
use crate::tailscale::{ApiClient, DynMeshControl, FunnelStatus};
use crate::telemetry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub deleted: usize,
    pub failed: usize,
}

pub async fn cleanup_managed_services(
    mesh: &DynMeshControl,
    api: Option<&ApiClient>,
) -> CleanupSummary {
    let mut summary = CleanupSummary::default();

    let serve = match mesh.serve_status().await {
        Ok(serve) => serve,
        Err(error) => {
            warn!(%error, "cleanup skipped; serve status unavailable");
            return summary;
        }
    };
    let funnel = match mesh.funnel_status().await {
        Ok(funnel) => funnel,
        Err(error) => {
            warn!(%error, "funnel status unavailable; cleaning serve entries only");
            FunnelStatus::default()
        }
    };

    let names: Vec<String> = managed_records(&serve, &funnel).into_keys().collect();
    if names.is_empty() {
        info!("no managed services to clean up");
        return summary;
    }

    for name in names {
        match mesh.delete_service(&name).await {
            Ok(()) => {
                info!(service = %name, "removed service during shutdown");
                telemetry::record_service_apply("delete", "ok");
                summary.deleted += 1;
                remove_registry_entry(api, &name).await;
            }
            Err(error) => {
                warn!(service = %name, %error, "failed to remove service during shutdown");
                telemetry::record_service_apply("delete", "error");
                summary.failed += 1;
            }
        }
    }

    info!(
        deleted = summary.deleted,
        failed = summary.failed,
        "shutdown cleanup finished"
    );
    summary
}
