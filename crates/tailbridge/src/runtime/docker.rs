use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as DockerError,
    models::{EventMessage, PortMap},
    query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions},
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::labels;
use crate::runtime::{
    ContainerInspection, ContainerRuntime, ContainerRuntimeError, EnabledContainer, EventAction,
    LifecycleEvent, short_id,
};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the standard environment (`DOCKER_HOST` or the default
    /// socket). The connection is lazy; failures surface on first use.
    pub fn connect() -> Result<Self, ContainerRuntimeError> {
        let docker =
            Docker::connect_with_defaults().map_err(|err| ContainerRuntimeError::Connection {
                context: "connect",
                source: err.into(),
            })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_enabled_containers(&self) -> Result<Vec<EnabledContainer>, ContainerRuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", labels::ENABLE)],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|err| {
                map_connection_or(err, "list_containers", |source| {
                    ContainerRuntimeError::ListContainers(source.into())
                })
            })?;

        let mut enabled = Vec::new();
        for summary in containers {
            let Some(id) = summary.id else {
                continue;
            };
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_else(|| short_id(&id).to_string());
            enabled.push(EnabledContainer {
                id,
                name,
                labels: summary.labels.unwrap_or_default(),
            });
        }

        Ok(enabled)
    }

    async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerInspection, ContainerRuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| {
                map_docker_error(err, id, "inspect_container", |id, source| {
                    ContainerRuntimeError::InspectContainer {
                        id,
                        source: source.into(),
                    }
                })
            })?;

        let name = details
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| short_id(id).to_string());
        let network_mode = details
            .host_config
            .as_ref()
            .and_then(|config| config.network_mode.clone());
        let port_bindings =
            collect_port_map(details.host_config.and_then(|config| config.port_bindings));
        let networks = details
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .map(|networks| {
                networks
                    .iter()
                    .map(|(network, endpoint)| {
                        (
                            network.clone(),
                            endpoint.ip_address.clone().unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        let published_ports =
            collect_port_map(details.network_settings.and_then(|settings| settings.ports));

        Ok(ContainerInspection {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name,
            network_mode,
            networks,
            port_bindings,
            published_ports,
        })
    }

    async fn watch_lifecycle_events(
        &self,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Result<(), ContainerRuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec![
                EventAction::Start.as_str().to_string(),
                EventAction::Stop.as_str().to_string(),
                EventAction::Die.as_str().to_string(),
                EventAction::Restart.as_str().to_string(),
            ],
        );

        let mut stream = self.docker.events(Some(EventsOptions {
            filters: Some(filters),
            ..Default::default()
        }));

        while let Some(message) = stream.next().await {
            let message = message.map_err(|err| {
                map_connection_or(err, "events", |source| {
                    ContainerRuntimeError::EventStream(source.into())
                })
            })?;
            let Some(event) = map_event(message) else {
                continue;
            };
            if events.send(event).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

fn map_event(message: EventMessage) -> Option<LifecycleEvent> {
    let action = EventAction::parse(message.action.as_deref()?)?;
    let actor = message.actor?;
    let container_id = actor.id?;
    let container_name = actor
        .attributes
        .as_ref()
        .and_then(|attributes| attributes.get("name"))
        .cloned();
    Some(LifecycleEvent {
        action,
        container_id,
        container_name,
    })
}

/// Flattens a Docker port map into `"8080/tcp"` to host-port strings,
/// dropping bindings without a host port.
fn collect_port_map(ports: Option<PortMap>) -> BTreeMap<String, Vec<String>> {
    let mut collected = BTreeMap::new();
    for (key, bindings) in ports.into_iter().flatten() {
        let host_ports: Vec<String> = bindings
            .into_iter()
            .flatten()
            .filter_map(|binding| binding.host_port)
            .filter(|port| !port.is_empty())
            .collect();
        collected.insert(key, host_ports);
    }
    collected
}

fn map_connection_or<F>(err: DockerError, context: &'static str, wrap: F) -> ContainerRuntimeError
where
    F: FnOnce(DockerError) -> ContainerRuntimeError,
{
    if is_connection_error(&err) {
        ContainerRuntimeError::Connection {
            context,
            source: err.into(),
        }
    } else {
        wrap(err)
    }
}

fn map_docker_error<F>(
    err: DockerError,
    id: &str,
    context: &'static str,
    wrap: F,
) -> ContainerRuntimeError
where
    F: FnOnce(String, DockerError) -> ContainerRuntimeError,
{
    if is_not_found(&err) {
        ContainerRuntimeError::NotFound { id: id.to_string() }
    } else if is_connection_error(&err) {
        ContainerRuntimeError::Connection {
            context,
            source: err.into(),
        }
    } else {
        wrap(id.to_string(), err)
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_connection_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::IOError { .. }
            | DockerError::HyperResponseError { .. }
            | DockerError::RequestTimeoutError
            | DockerError::SocketNotFoundError(_)
    )
}
