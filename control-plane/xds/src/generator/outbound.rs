use super::{
    access_log, cluster_name, load_assignment, mesh_tls, ResourceGenerator,
    DEFAULT_CONNECT_TIMEOUT_MS,
};
use crate::{
    resources::{
        Cluster, Direction, Discovery, Filter, FilterChain, Listener, ResourceSet, RetryPolicy,
        Route, RouteConfiguration, TlsContext, VirtualHost, WeightedCluster,
    },
    Error,
};
use mesh_control_plane_core::{
    policy::{LoadBalancer, PolicyConf, TimeoutConf},
    proxy::{DataplaneProxy, Endpoint},
    Proxy, TagSelector, Tags,
};
use std::collections::BTreeSet;

/// Generates a listener, a route configuration and the clusters of each outbound of a
/// dataplane.
#[derive(Copy, Clone, Debug, Default)]
pub struct OutboundGenerator;

const OUTBOUND_ADDRESS: &str = "127.0.0.1";

impl ResourceGenerator for OutboundGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        let Some(dp) = proxy.as_dataplane() else {
            return Ok(resources);
        };
        let spec = &dp.dataplane.spec;

        let mut clusters = BTreeSet::new();
        for outbound in &spec.networking.outbound {
            let Some(service) = outbound.tags.service() else {
                continue;
            };
            if !spec.reaches(service) {
                continue;
            }

            let splits = splits(dp, service, &outbound.tags);
            let mut filters = Vec::new();
            if let Some(PolicyConf::RateLimit(conf)) = dp
                .policies
                .rate_limits_outbound
                .get(service)
                .map(|p| &p.spec.conf)
            {
                filters.push(Filter::RateLimit {
                    requests: conf.requests,
                    interval_ms: conf.interval_ms,
                    status: conf.on_rate_limit_status,
                });
            }
            let route_config = format!("outbound:{service}");
            filters.push(Filter::HttpConnectionManager {
                stat_prefix: service.to_string(),
                route_config: route_config.clone(),
                access_log: dp.policies.traffic_logs.get(service).map(access_log),
                idle_timeout_ms: timeout(dp, service).and_then(|t| t.http_idle_timeout_ms),
            });

            let address = outbound.address.as_deref().unwrap_or(OUTBOUND_ADDRESS);
            resources.add(Listener {
                name: format!("outbound:{address}:{}", outbound.port),
                address: address.to_string(),
                port: outbound.port,
                direction: Direction::Outbound,
                filter_chains: vec![FilterChain {
                    name: service.to_string(),
                    filters,
                    ..Default::default()
                }],
            });
            resources.add(RouteConfiguration {
                name: route_config,
                virtual_hosts: vec![virtual_host(dp, service, &splits, vec!["*".to_string()])],
            });
            clusters.extend(splits.into_iter().map(|(_, selector)| selector));
        }

        for selector in &clusters {
            let (cluster, endpoints) = destination_cluster(dp, selector);
            resources.add(load_assignment(cluster.name.clone(), endpoints));
            resources.add(cluster);
        }

        Ok(resources)
    }
}

/// The weighted destinations of traffic to a service: the splits of its traffic route, or the
/// outbound's own tags.
pub(super) fn splits(dp: &DataplaneProxy, service: &str, tags: &Tags) -> Vec<(u32, TagSelector)> {
    let route = dp.routing.traffic_routes.get(service);
    let splits = route
        .and_then(|route| match &route.spec.conf {
            PolicyConf::TrafficRoute(conf) => Some(&conf.split),
            _ => None,
        })
        .into_iter()
        .flatten()
        .filter(|split| split.destination.service_name().is_some())
        .map(|split| (split.weight, split.destination.clone()))
        .collect::<Vec<_>>();
    if splits.is_empty() {
        return vec![(1, TagSelector::from(tags))];
    }
    splits
}

pub(super) fn virtual_host(
    dp: &DataplaneProxy,
    service: &str,
    splits: &[(u32, TagSelector)],
    domains: Vec<String>,
) -> VirtualHost {
    let retry = dp.policies.retries.get(service).and_then(|p| match &p.spec.conf {
        PolicyConf::Retry(conf) => Some(RetryPolicy {
            num_retries: conf.num_retries,
            per_try_timeout_ms: conf.per_try_timeout_ms,
            retry_on: conf.retry_on.clone(),
        }),
        _ => None,
    });
    VirtualHost {
        name: service.to_string(),
        domains,
        routes: vec![Route {
            prefix: "/".to_string(),
            clusters: splits
                .iter()
                .map(|(weight, selector)| WeightedCluster {
                    name: cluster_name(selector),
                    weight: *weight,
                })
                .collect(),
            timeout_ms: timeout(dp, service).and_then(|t| t.http_request_timeout_ms),
            retry,
        }],
    }
}

/// Builds the cluster of a destination selector along with its endpoints.
fn destination_cluster<'d>(
    dp: &'d DataplaneProxy,
    selector: &TagSelector,
) -> (Cluster, Vec<&'d Endpoint>) {
    let service = selector.service_name().unwrap_or_default();
    let name = cluster_name(selector);

    let internal = dp.routing.outbound_targets.get(service);
    let external = dp.routing.external_service_targets.get(service);
    let endpoints = internal
        .or(external)
        .into_iter()
        .flatten()
        .filter(|ep| selector.matches(&ep.tags))
        .collect::<Vec<_>>();

    // Zone proxies pick the destination by server name.
    let mesh = dp.mesh.name();
    let sni = format!("{name}.{mesh}");
    let tls = match endpoints.first().and_then(|ep| ep.external.as_ref()) {
        Some(external) if external.via_egress => Some(mesh_tls(mesh, Some(sni))),
        Some(external) if external.tls => Some(TlsContext {
            identity_secret: None,
            ca_secret: None,
            sni: external.server_name.clone(),
        }),
        Some(_) => None,
        None => dp
            .mesh
            .spec
            .mtls_enabled()
            .then(|| mesh_tls(mesh, Some(sni))),
    };

    let route = dp.routing.traffic_routes.get(service);
    let lb_policy = route
        .and_then(|route| match &route.spec.conf {
            PolicyConf::TrafficRoute(conf) => conf.load_balancer,
            _ => None,
        })
        .unwrap_or(LoadBalancer::RoundRobin);

    let cluster = Cluster {
        connect_timeout_ms: timeout(dp, service)
            .map(|t| t.connect_timeout_ms)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        lb_policy,
        circuit_breakers: dp
            .policies
            .circuit_breakers
            .get(service)
            .and_then(|p| match &p.spec.conf {
                PolicyConf::CircuitBreaker(conf) => Some(conf.clone()),
                _ => None,
            }),
        health_check: dp
            .policies
            .health_checks
            .get(service)
            .and_then(|p| match &p.spec.conf {
                PolicyConf::HealthCheck(conf) => Some(conf.clone()),
                _ => None,
            }),
        discovery: Discovery::Eds,
        tls,
        name,
    };
    (cluster, endpoints)
}

fn timeout<'d>(dp: &'d DataplaneProxy, service: &str) -> Option<&'d TimeoutConf> {
    match &dp.policies.timeouts.get(service)?.spec.conf {
        PolicyConf::Timeout(conf) => Some(conf),
        _ => None,
    }
}
