use super::{mesh_tls, principals, ResourceGenerator, DEFAULT_CONNECT_TIMEOUT_MS};
use crate::{
    resources::{
        Cluster, Direction, Discovery, Filter, FilterChain, Listener, RbacPolicy, ResourceSet,
        WeightedCluster,
    },
    Error,
};
use mesh_control_plane_core::{
    policy::{LoadBalancer, PolicyConf},
    Proxy,
};

/// Generates a listener for each inbound of a sidecar, forwarding to the local workload.
///
/// With mTLS, listeners terminate mesh TLS and only admit the sources of the traffic
/// permissions that apply to the inbound.
#[derive(Copy, Clone, Debug, Default)]
pub struct InboundGenerator;

impl ResourceGenerator for InboundGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        let Some(dp) = proxy.as_dataplane() else {
            return Ok(resources);
        };
        let mesh = dp.mesh.name();
        let mtls = dp.mesh.spec.mtls_enabled();
        let spec = &dp.dataplane.spec;

        for inbound in &spec.networking.inbound {
            let iface = spec.inbound_interface(inbound);
            let cluster = format!("localhost:{}", iface.workload_port);
            resources.add(Cluster {
                name: cluster.clone(),
                discovery: Discovery::Static {
                    address: iface.workload_address.clone(),
                    port: iface.workload_port,
                },
                connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
                lb_policy: LoadBalancer::RoundRobin,
                circuit_breakers: None,
                health_check: None,
                tls: None,
            });

            let mut filters = Vec::new();
            if mtls {
                let policies = dp
                    .policies
                    .traffic_permissions
                    .get(&iface)
                    .into_iter()
                    .flatten()
                    .map(|p| RbacPolicy {
                        name: p.name().to_string(),
                        principals: principals(mesh, &p.spec.sources),
                    })
                    .collect();
                filters.push(Filter::Rbac { policies });
            }
            for policy in dp.policies.fault_injections.get(&iface).into_iter().flatten() {
                if let PolicyConf::FaultInjection(conf) = &policy.spec.conf {
                    filters.push(Filter::Fault {
                        delay: conf.delay.clone(),
                        abort: conf.abort.clone(),
                        response_bandwidth: conf.response_bandwidth.clone(),
                    });
                }
            }
            // Only the most specific rate limit applies.
            let rate_limit = dp
                .policies
                .rate_limits_inbound
                .get(&iface)
                .and_then(|policies| policies.first());
            if let Some(PolicyConf::RateLimit(conf)) = rate_limit.map(|p| &p.spec.conf) {
                filters.push(Filter::RateLimit {
                    requests: conf.requests,
                    interval_ms: conf.interval_ms,
                    status: conf.on_rate_limit_status,
                });
            }
            filters.push(Filter::TcpProxy {
                stat_prefix: cluster.clone(),
                clusters: vec![WeightedCluster {
                    name: cluster,
                    weight: 1,
                }],
                access_log: None,
                idle_timeout_ms: None,
            });

            resources.add(Listener {
                name: format!("inbound:{}:{}", iface.dataplane_address, iface.dataplane_port),
                address: iface.dataplane_address.clone(),
                port: iface.dataplane_port,
                direction: Direction::Inbound,
                filter_chains: vec![FilterChain {
                    name: iface.to_string(),
                    server_names: vec![],
                    tls: mtls.then(|| mesh_tls(mesh, None)),
                    filters,
                }],
            });
        }

        Ok(resources)
    }
}
