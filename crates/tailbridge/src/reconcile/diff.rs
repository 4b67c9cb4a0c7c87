//! Projection of mesh status into comparable records, and the three-way
//! diff against desired state. Only `svc:`-prefixed services are projected;
//! everything else on the node is invisible to the reconciler.

use std::collections::{BTreeMap, BTreeSet};

use crate::service::{DesiredService, FunnelProtocol, ServiceProtocol, is_managed_name};
use crate::tailscale::{FunnelStatus, ServeStatus};

/// How a TCP binding terminates. Plain forwards carry no destination in
/// status output, so drift on them is limited to the binding itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    Http,
    Https,
    Plain,
}

impl From<ServiceProtocol> for TcpMode {
    fn from(protocol: ServiceProtocol) -> Self {
        match protocol {
            ServiceProtocol::Http => Self::Http,
            ServiceProtocol::Https => Self::Https,
            ServiceProtocol::Tcp | ServiceProtocol::TlsTerminatedTcp => Self::Plain,
        }
    }
}

impl From<FunnelProtocol> for TcpMode {
    fn from(protocol: FunnelProtocol) -> Self {
        match protocol {
            FunnelProtocol::Https => Self::Https,
            FunnelProtocol::Tcp | FunnelProtocol::TlsTerminatedTcp => Self::Plain,
        }
    }
}

/// One managed service as the mesh currently has it, keyed portwise so it
/// compares structurally against [`expected_record`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedServiceRecord {
    /// TCP bindings by service port.
    pub tcp: BTreeMap<u16, TcpMode>,
    /// Web proxy destinations by service port.
    pub proxies: BTreeMap<u16, String>,
    /// Ports with funnel enabled.
    pub funnel: BTreeSet<u16>,
}

/// Extracts the managed services from the two status reads, keyed by
/// qualified name. Funnel permissions without a serve config still produce
/// a record so orphaned funnels get cleaned up.
pub fn managed_records(
    serve: &ServeStatus,
    funnel: &FunnelStatus,
) -> BTreeMap<String, ManagedServiceRecord> {
    let mut records: BTreeMap<String, ManagedServiceRecord> = BTreeMap::new();

    for (name, config) in &serve.services {
        if !is_managed_name(name) {
            continue;
        }
        let record = records.entry(name.clone()).or_default();
        for (port_key, tcp) in &config.tcp {
            let Ok(port) = port_key.parse::<u16>() else {
                continue;
            };
            let mode = if tcp.https {
                TcpMode::Https
            } else if tcp.http {
                TcpMode::Http
            } else {
                TcpMode::Plain
            };
            record.tcp.insert(port, mode);
        }
        for (host_port, web) in &config.web {
            let Some(port) = trailing_port(host_port) else {
                continue;
            };
            let Some(handler) = web.handlers.get("/") else {
                continue;
            };
            if handler.proxy.is_empty() {
                continue;
            }
            record.proxies.insert(port, handler.proxy.clone());
        }
    }

    for (key, allowed) in &funnel.allow_funnel {
        if !*allowed {
            continue;
        }
        let Some((name, port)) = split_funnel_key(key) else {
            continue;
        };
        if !is_managed_name(name) {
            continue;
        }
        records.entry(name.to_string()).or_default().funnel.insert(port);
    }

    records
}

/// The record [`managed_records`] would produce once `service` is applied.
pub fn expected_record(service: &DesiredService) -> ManagedServiceRecord {
    let mut record = ManagedServiceRecord::default();
    record
        .tcp
        .insert(service.service_port, TcpMode::from(service.service_protocol));
    if service.service_protocol.is_web() {
        record
            .proxies
            .insert(service.service_port, service.destination());
    }

    if let Some(funnel) = &service.funnel {
        record
            .tcp
            .insert(funnel.public_port, TcpMode::from(funnel.protocol));
        if funnel.protocol == FunnelProtocol::Https {
            if let Some(destination) = service.funnel_destination() {
                record.proxies.insert(funnel.public_port, destination);
            }
        }
        record.funnel.insert(funnel.public_port);
    }

    record
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ServiceDiff {
    pub create: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

impl ServiceDiff {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Compares desired services against the projected mesh records. Both maps
/// are keyed by qualified name; output is sorted by key order.
pub fn diff(
    desired: &BTreeMap<String, DesiredService>,
    current: &BTreeMap<String, ManagedServiceRecord>,
) -> ServiceDiff {
    let mut diff = ServiceDiff::default();

    for (name, service) in desired {
        match current.get(name) {
            None => diff.create.push(name.clone()),
            Some(record) if *record != expected_record(service) => diff.update.push(name.clone()),
            Some(_) => {}
        }
    }
    for name in current.keys() {
        if !desired.contains_key(name) {
            diff.delete.push(name.clone());
        }
    }

    diff
}

fn trailing_port(key: &str) -> Option<u16> {
    key.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
}

/// Splits an allow-funnel key `svc:<name>:<port>` into the qualified name
/// and the port.
fn split_funnel_key(key: &str) -> Option<(&str, u16)> {
    let (name, port) = key.rsplit_once(':')?;
    Some((name, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{BackendProtocol, FunnelSpec};

    fn web_service() -> DesiredService {
        DesiredService {
            container_id: "0123456789ab".to_string(),
            container_name: "web-1".to_string(),
            name: "web".to_string(),
            backend_protocol: BackendProtocol::Http,
            service_protocol: ServiceProtocol::Https,
            service_port: 443,
            dest_addr: "172.18.0.5".to_string(),
            dest_port: 8080,
            tags: vec!["tag:container".to_string()],
            funnel: None,
        }
    }

    fn serve_status(raw: &str) -> ServeStatus {
        serde_json::from_str(raw).expect("serve status")
    }

    fn funnel_status(raw: &str) -> FunnelStatus {
        serde_json::from_str(raw).expect("funnel status")
    }

    #[test]
    fn projection_skips_services_without_the_managed_prefix() {
        let serve = serve_status(
            r#"{"Services": {
                "svc:web": {"TCP": {"443": {"HTTPS": true}}},
                "hand-made": {"TCP": {"80": {"HTTP": true}}}
            }}"#,
        );
        let funnel = funnel_status(r#"{"AllowFunnel": {"node.example.ts.net:443": true}}"#);

        let records = managed_records(&serve, &funnel);
        assert_eq!(records.len(), 1);
        assert!(records.contains_key("svc:web"));
    }

    #[test]
    fn projection_collects_tcp_web_and_funnel_portwise() {
        let serve = serve_status(
            r#"{"Services": {
                "svc:web": {
                    "TCP": {"443": {"HTTPS": true}, "8443": {"HTTPS": true}},
                    "Web": {
                        "web.example.ts.net:443": {"Handlers": {"/": {"Proxy": "http://172.18.0.5:8080"}}},
                        "web.example.ts.net:8443": {"Handlers": {"/": {"Proxy": "http://172.18.0.5:9090"}}}
                    }
                }
            }}"#,
        );
        let funnel = funnel_status(r#"{"AllowFunnel": {"svc:web:8443": true, "svc:web:443": false}}"#);

        let records = managed_records(&serve, &funnel);
        let record = records.get("svc:web").expect("record");
        assert_eq!(record.tcp.get(&443), Some(&TcpMode::Https));
        assert_eq!(record.tcp.get(&8443), Some(&TcpMode::Https));
        assert_eq!(
            record.proxies.get(&443).map(String::as_str),
            Some("http://172.18.0.5:8080")
        );
        assert_eq!(record.funnel.iter().copied().collect::<Vec<_>>(), vec![8443]);
    }

    #[test]
    fn orphaned_funnel_permissions_still_project_a_record() {
        let serve = ServeStatus::default();
        let funnel = funnel_status(r#"{"AllowFunnel": {"svc:stale:443": true}}"#);

        let records = managed_records(&serve, &funnel);
        let record = records.get("svc:stale").expect("record");
        assert!(record.tcp.is_empty());
        assert_eq!(record.funnel.iter().copied().collect::<Vec<_>>(), vec![443]);
    }

    #[test]
    fn expected_record_for_a_web_service_binds_tcp_and_proxy() {
        let record = expected_record(&web_service());
        assert_eq!(record.tcp.get(&443), Some(&TcpMode::Https));
        assert_eq!(
            record.proxies.get(&443).map(String::as_str),
            Some("http://172.18.0.5:8080")
        );
        assert!(record.funnel.is_empty());
    }

    #[test]
    fn expected_record_for_a_tcp_service_has_no_proxy() {
        let mut service = web_service();
        service.backend_protocol = BackendProtocol::Tcp;
        service.service_protocol = ServiceProtocol::Tcp;
        service.service_port = 5432;

        let record = expected_record(&service);
        assert_eq!(record.tcp.get(&5432), Some(&TcpMode::Plain));
        assert!(record.proxies.is_empty());
    }

    #[test]
    fn expected_record_with_a_funnel_adds_the_public_binding() {
        let mut service = web_service();
        service.funnel = Some(FunnelSpec {
            public_port: 8443,
            protocol: FunnelProtocol::Https,
            target_port: 9090,
            dest_port: 9090,
        });

        let record = expected_record(&service);
        assert_eq!(record.tcp.get(&8443), Some(&TcpMode::Https));
        assert_eq!(
            record.proxies.get(&8443).map(String::as_str),
            Some("http://172.18.0.5:9090")
        );
        assert_eq!(record.funnel.iter().copied().collect::<Vec<_>>(), vec![8443]);
    }

    #[test]
    fn tcp_funnels_bind_without_a_proxy() {
        let mut service = web_service();
        service.backend_protocol = BackendProtocol::Tcp;
        service.service_protocol = ServiceProtocol::Tcp;
        service.service_port = 5432;
        service.funnel = Some(FunnelSpec {
            public_port: 9000,
            protocol: FunnelProtocol::Tcp,
            target_port: 5432,
            dest_port: 5432,
        });

        let record = expected_record(&service);
        assert_eq!(record.tcp.get(&9000), Some(&TcpMode::Plain));
        assert!(record.proxies.is_empty());
        assert_eq!(record.funnel.iter().copied().collect::<Vec<_>>(), vec![9000]);
    }

    #[test]
    fn diff_creates_missing_updates_drifted_and_deletes_extra() {
        let service = web_service();
        let mut desired = BTreeMap::new();
        desired.insert(service.qualified_name(), service.clone());

        // Nothing on the node yet.
        let diff_result = diff(&desired, &BTreeMap::new());
        assert_eq!(diff_result.create, vec!["svc:web"]);
        assert!(diff_result.update.is_empty() && diff_result.delete.is_empty());

        // Matching record: converged.
        let mut current = BTreeMap::new();
        current.insert(service.qualified_name(), expected_record(&service));
        assert!(diff(&desired, &current).is_empty());

        // Drifted destination: update.
        let mut drifted = expected_record(&service);
        drifted
            .proxies
            .insert(443, "http://172.18.0.9:8080".to_string());
        let mut current = BTreeMap::new();
        current.insert(service.qualified_name(), drifted);
        assert_eq!(diff(&desired, &current).update, vec!["svc:web"]);

        // Extra managed service: delete.
        let mut current = BTreeMap::new();
        current.insert(service.qualified_name(), expected_record(&service));
        current.insert("svc:stale".to_string(), ManagedServiceRecord::default());
        assert_eq!(diff(&desired, &current).delete, vec!["svc:stale"]);
    }

    #[test]
    fn diff_flags_a_lost_funnel_as_drift() {
        let mut service = web_service();
        service.funnel = Some(FunnelSpec {
            public_port: 443,
            protocol: FunnelProtocol::Https,
            target_port: 8080,
            dest_port: 8080,
        });
        let mut desired = BTreeMap::new();
        desired.insert(service.qualified_name(), service.clone());

        let mut without_funnel = expected_record(&service);
        without_funnel.funnel.clear();
        let mut current = BTreeMap::new();
        current.insert(service.qualified_name(), without_funnel);

        assert_eq!(diff(&desired, &current).update, vec!["svc:web"]);
    }

    #[test]
    fn applied_records_round_trip_to_a_converged_diff() {
        let mut funneled = web_service();
        funneled.funnel = Some(FunnelSpec {
            public_port: 8443,
            protocol: FunnelProtocol::Https,
            target_port: 9090,
            dest_port: 9090,
        });
        let mut tcp = web_service();
        tcp.name = "db".to_string();
        tcp.backend_protocol = BackendProtocol::Tcp;
        tcp.service_protocol = ServiceProtocol::Tcp;
        tcp.service_port = 5432;

        let mut desired = BTreeMap::new();
        for service in [funneled, tcp] {
            desired.insert(service.qualified_name(), service);
        }

        let current: BTreeMap<_, _> = desired
            .iter()
            .map(|(name, service)| (name.clone(), expected_record(service)))
            .collect();
        assert!(diff(&desired, &current).is_empty());
    }
}
