use super::{cluster_name, load_assignment, ResourceGenerator, DEFAULT_CONNECT_TIMEOUT_MS};
use crate::{
    resources::{
        Cluster, Direction, Discovery, Filter, FilterChain, Listener, ResourceSet,
        WeightedCluster,
    },
    Error,
};
use mesh_control_plane_core::{
    policy::{LoadBalancer, PolicyConf},
    Proxy, ProxyKind, TagSelector,
};
use std::collections::BTreeSet;

/// Generates the listener of a zone ingress. Connections from other zones are passed through,
/// unterminated, to local endpoints chosen by TLS server name.
///
/// Besides one destination per service, every subset targeted by a traffic route split gets
/// its own server name.
#[derive(Copy, Clone, Debug, Default)]
pub struct IngressGenerator;

impl ResourceGenerator for IngressGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        let ProxyKind::Ingress(ingress) = &proxy.kind else {
            return Ok(resources);
        };

        let mut filter_chains = Vec::new();
        for mesh in &ingress.meshes {
            let mesh_name = mesh.mesh.name();

            let mut destinations = mesh
                .endpoints
                .keys()
                .map(|service| TagSelector::service(service.as_str()))
                .collect::<BTreeSet<_>>();
            let split_destinations = mesh
                .traffic_routes
                .iter()
                .filter_map(|route| match &route.spec.conf {
                    PolicyConf::TrafficRoute(conf) => Some(&conf.split),
                    _ => None,
                })
                .flatten()
                .map(|split| &split.destination)
                .filter(|dst| {
                    dst.service_name()
                        .is_some_and(|s| mesh.endpoints.contains_key(s))
                });
            destinations.extend(split_destinations.cloned());

            for selector in &destinations {
                let service = selector.service_name().unwrap_or_default();
                let name = format!("{mesh_name}:{}", cluster_name(selector));
                let endpoints = mesh
                    .endpoints
                    .get(service)
                    .into_iter()
                    .flatten()
                    .filter(|ep| selector.matches(&ep.tags));
                resources.add(load_assignment(name.clone(), endpoints));
                resources.add(Cluster {
                    name: name.clone(),
                    discovery: Discovery::Eds,
                    connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
                    lb_policy: LoadBalancer::RoundRobin,
                    circuit_breakers: None,
                    health_check: None,
                    tls: None,
                });
                filter_chains.push(FilterChain {
                    name: name.clone(),
                    server_names: vec![format!("{}.{mesh_name}", cluster_name(selector))],
                    tls: None,
                    filters: vec![Filter::TcpProxy {
                        stat_prefix: name.clone(),
                        clusters: vec![WeightedCluster { name, weight: 1 }],
                        access_log: None,
                        idle_timeout_ms: None,
                    }],
                });
            }
        }

        let (address, port) = (
            &ingress.zone_ingress.spec.networking.address,
            ingress.zone_ingress.spec.networking.port,
        );
        resources.add(Listener {
            name: format!("ingress:{address}:{port}"),
            address: address.clone(),
            port,
            direction: Direction::Inbound,
            filter_chains,
        });
        Ok(resources)
    }
}
