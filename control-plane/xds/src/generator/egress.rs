use super::{
    ca_secret, identity_secret, mesh_tls, principals, spiffe_id, ResourceGenerator,
    DEFAULT_CONNECT_TIMEOUT_MS,
};
use crate::{
    resources::{
        Cluster, ClusterLoadAssignment, Direction, Discovery, Filter, FilterChain, LbEndpoint,
        Listener, RbacPolicy, ResourceSet, Secret, SecretKind, TlsContext, WeightedCluster,
    },
    secrets::Secrets,
    Error,
};
use mesh_control_plane_core::{
    policy::{LoadBalancer, PolicyConf},
    Proxy, ProxyKind,
};
use std::sync::Arc;

/// The service name a zone egress identifies as.
const EGRESS_SERVICE: &str = "zone-egress";

/// Generates the listener of a zone egress: it terminates mesh mTLS from the local zone's
/// dataplanes and forwards each external service, chosen by TLS server name, to its address.
#[derive(Clone, Debug)]
pub struct EgressGenerator {
    secrets: Arc<Secrets>,
}

impl EgressGenerator {
    pub fn new(secrets: Arc<Secrets>) -> Self {
        Self { secrets }
    }
}

impl ResourceGenerator for EgressGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        let ProxyKind::Egress(egress) = &proxy.kind else {
            return Ok(resources);
        };

        let mut filter_chains = Vec::new();
        for mesh in &egress.meshes {
            let mesh_name = mesh.mesh.name();
            if let Some(backend) = mesh.mesh.spec.enabled_ca_backend() {
                let cert = self.secrets.identity(
                    &proxy.id,
                    mesh_name,
                    backend,
                    vec![spiffe_id(mesh_name, EGRESS_SERVICE)],
                );
                resources.add(Secret {
                    name: identity_secret(mesh_name),
                    kind: SecretKind::IdentityCert(cert),
                });
                resources.add(Secret {
                    name: ca_secret(mesh_name),
                    kind: SecretKind::CaBundle {
                        backend: backend.name.clone(),
                    },
                });
            }

            for es in &mesh.external_services {
                let Some(service) = es.spec.service() else {
                    continue;
                };
                let Some((host, port)) = es.spec.host_port() else {
                    tracing::debug!(
                        mesh = %mesh_name,
                        name = %es.name(),
                        address = %es.spec.networking.address,
                        "Ignoring external service with invalid address",
                    );
                    continue;
                };
                let name = format!("{mesh_name}:{service}");

                resources.add(ClusterLoadAssignment {
                    cluster_name: name.clone(),
                    endpoints: vec![LbEndpoint {
                        address: host.to_string(),
                        port,
                        weight: 1,
                        zone: None,
                        priority: 0,
                    }],
                });
                let tls = es.spec.tls_enabled().then(|| TlsContext {
                    identity_secret: None,
                    ca_secret: None,
                    sni: es
                        .spec
                        .networking
                        .tls
                        .as_ref()
                        .and_then(|t| t.server_name.clone())
                        .or_else(|| Some(host.to_string())),
                });
                resources.add(Cluster {
                    name: name.clone(),
                    discovery: Discovery::Eds,
                    connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
                    lb_policy: LoadBalancer::RoundRobin,
                    circuit_breakers: None,
                    health_check: None,
                    tls,
                });

                let mut filters = vec![Filter::Rbac {
                    policies: mesh
                        .traffic_permissions
                        .get(service)
                        .into_iter()
                        .flatten()
                        .map(|p| RbacPolicy {
                            name: p.name().to_string(),
                            principals: principals(mesh_name, &p.spec.sources),
                        })
                        .collect(),
                }];
                for policy in mesh.fault_injections.get(service).into_iter().flatten() {
                    if let PolicyConf::FaultInjection(conf) = &policy.spec.conf {
                        filters.push(Filter::Fault {
                            delay: conf.delay.clone(),
                            abort: conf.abort.clone(),
                            response_bandwidth: conf.response_bandwidth.clone(),
                        });
                    }
                }
                let rate_limit = mesh
                    .rate_limits
                    .get(service)
                    .and_then(|policies| policies.first());
                if let Some(PolicyConf::RateLimit(conf)) = rate_limit.map(|p| &p.spec.conf) {
                    filters.push(Filter::RateLimit {
                        requests: conf.requests,
                        interval_ms: conf.interval_ms,
                        status: conf.on_rate_limit_status,
                    });
                }
                filters.push(Filter::TcpProxy {
                    stat_prefix: name.clone(),
                    clusters: vec![WeightedCluster {
                        name: name.clone(),
                        weight: 1,
                    }],
                    access_log: None,
                    idle_timeout_ms: None,
                });

                filter_chains.push(FilterChain {
                    server_names: vec![format!("{service}.{mesh_name}")],
                    tls: Some(mesh_tls(mesh_name, None)),
                    filters,
                    name,
                });
            }
        }

        let networking = &egress.zone_egress.spec.networking;
        resources.add(Listener {
            name: format!("egress:{}:{}", networking.address, networking.port),
            address: networking.address.clone(),
            port: networking.port,
            direction: Direction::Inbound,
            filter_chains,
        });
        Ok(resources)
    }
}
