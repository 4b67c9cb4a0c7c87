//! Desired-state assembly: interpret each enabled container's labels,
//! resolve its destinations, and key the result by qualified service name.
//! A bad container is skipped with a warning; only a runtime-wide failure
//! aborts the pass.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::interpret;
use crate::resolve;
use crate::runtime::{ContainerRuntimeError, DynContainerRuntime};
use crate::service::{DesiredService, FunnelSpec};

pub async fn build_desired(
    runtime: &DynContainerRuntime,
    default_tags: &[String],
    probe_timeout: Duration,
) -> Result<BTreeMap<String, DesiredService>, ContainerRuntimeError> {
    let containers = runtime.list_enabled_containers().await?;
    let mut desired: BTreeMap<String, DesiredService> = BTreeMap::new();

    for container in containers {
        let intent = match interpret::interpret(&container.name, &container.labels, default_tags) {
            Ok(Some(intent)) => intent,
            Ok(None) => continue,
            Err(error) => {
                warn!(container = %container.name, %error, "skipping container with invalid labels");
                continue;
            }
        };

        let inspection = match runtime.inspect_container(&container.id).await {
            Ok(inspection) => inspection,
            Err(ContainerRuntimeError::NotFound { .. }) => {
                debug!(container = %container.name, "container vanished before inspection");
                continue;
            }
            Err(error) if error.is_connection_error() => return Err(error),
            Err(error) => {
                warn!(container = %container.name, %error, "skipping container; inspection failed");
                continue;
            }
        };

        let mode = resolve::resolution_mode(&inspection, intent.direct, intent.network.as_deref());
        let destination = match resolve::resolve_destination(
            &inspection,
            &mode,
            intent.target_port,
            probe_timeout,
        )
        .await
        {
            Ok(destination) => destination,
            Err(error) => {
                warn!(container = %container.name, %error, "skipping container; destination resolution failed");
                continue;
            }
        };

        let funnel = match &intent.funnel {
            Some(funnel_intent) => {
                match resolve::resolve_destination(
                    &inspection,
                    &mode,
                    funnel_intent.target_port,
                    probe_timeout,
                )
                .await
                {
                    Ok(funnel_destination) => Some(FunnelSpec {
                        public_port: funnel_intent.public_port,
                        protocol: funnel_intent.protocol,
                        target_port: funnel_intent.target_port,
                        dest_port: funnel_destination.port,
                    }),
                    Err(error) => {
                        warn!(container = %container.name, %error, "skipping container; funnel destination resolution failed");
                        continue;
                    }
                }
            }
            None => None,
        };

        let service = DesiredService {
            container_id: container.short_id().to_string(),
            container_name: container.name.clone(),
            name: intent.name,
            backend_protocol: intent.backend_protocol,
            service_protocol: intent.service_protocol,
            service_port: intent.service_port,
            dest_addr: destination.addr,
            dest_port: destination.port,
            tags: intent.tags,
            funnel,
        };

        let qualified = service.qualified_name();
        if let Some(winner) = desired.get(&qualified) {
            warn!(
                service = %qualified,
                container = %container.name,
                winner = %winner.container_name,
                "duplicate service name; first listed container wins"
            );
            continue;
        }
        desired.insert(qualified, service);
    }

    Ok(desired)
}
