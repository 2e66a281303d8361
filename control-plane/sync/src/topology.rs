//! Derives routes, destinations, and endpoints from the resources of a mesh.

use mesh_control_plane_core::{
    dataplane::{Dataplane, ZoneEgress},
    mesh::MeshSpec,
    policy::PolicyConf,
    policy_match,
    proxy::{DestinationMap, Endpoint, EndpointMap, ExternalTarget, Locality, ServiceName},
    resource::{
        DataplaneResource, ExternalServiceResource, ZoneEgressResource, ZoneIngressResource,
    },
    PolicyRef, TagSelector, Tags,
};
use std::{collections::BTreeMap, sync::Arc};

/// Returns an endpoint for every ready inbound of every non-gateway dataplane, keyed by the
/// inbound's service.
pub fn inbound_endpoints(
    mesh: &MeshSpec,
    dataplanes: &[Arc<DataplaneResource>],
    local_zone: &str,
) -> EndpointMap {
    let mut endpoints = EndpointMap::new();
    for dataplane in dataplanes {
        let dp = &dataplane.spec;
        if dp.is_gateway() {
            continue;
        }
        for inbound in &dp.networking.inbound {
            let Some(service) = inbound.tags.service() else {
                continue;
            };
            if !inbound.is_ready() {
                continue;
            }
            let iface = dp.inbound_interface(inbound);
            let zone = inbound.tags.zone().unwrap_or(local_zone);
            endpoints
                .entry(service.to_string())
                .or_default()
                .push(Endpoint {
                    target: iface.dataplane_advertised_address,
                    port: iface.dataplane_port,
                    tags: inbound.tags.clone(),
                    weight: 1,
                    locality: locality(mesh, zone, local_zone),
                    external: None,
                });
        }
    }
    endpoints
}

/// Adds endpoints for services of this mesh that zone ingresses in other zones make available.
///
/// Cross-zone traffic requires mTLS, so nothing is added unless the mesh enables it.
pub fn add_ingress_endpoints(
    endpoints: &mut EndpointMap,
    mesh_name: &str,
    mesh: &MeshSpec,
    ingresses: &[Arc<ZoneIngressResource>],
    local_zone: &str,
) {
    if !mesh.mtls_enabled() {
        return;
    }
    for ingress in ingresses {
        let zi = &ingress.spec;
        if zi.zone.is_empty() || zi.zone == local_zone {
            continue;
        }
        let (address, port) = zi.networking.advertised();
        for available in &zi.available_services {
            if available.mesh != mesh_name || available.external_service {
                continue;
            }
            let Some(service) = available.tags.service() else {
                continue;
            };
            endpoints
                .entry(service.to_string())
                .or_default()
                .push(Endpoint {
                    target: address.to_string(),
                    port,
                    tags: available.tags.clone(),
                    weight: available.instances,
                    locality: locality(mesh, &zi.zone, local_zone),
                    external: None,
                });
        }
    }
}

/// Returns endpoints for external services, keyed by service.
///
/// When the mesh routes through zone egresses, each external service is reached through every
/// egress of the local zone. Otherwise it is reached directly.
pub fn external_service_endpoints(
    mesh: &MeshSpec,
    external_services: &[Arc<ExternalServiceResource>],
    egresses: &[Arc<ZoneEgressResource>],
    local_zone: &str,
) -> EndpointMap {
    let local_egresses = egresses
        .iter()
        .map(|e| &e.spec)
        .filter(|e| e.zone.is_empty() || e.zone == local_zone)
        .collect::<Vec<&ZoneEgress>>();
    let via_egress = mesh.zone_egress_enabled() && !local_egresses.is_empty();

    let mut endpoints = EndpointMap::new();
    for external_service in external_services {
        let es = &external_service.spec;
        let Some(service) = es.service() else {
            continue;
        };
        let Some((host, port)) = es.host_port() else {
            tracing::debug!(
                name = %external_service.name(),
                address = %es.networking.address,
                "Ignoring external service with invalid address",
            );
            continue;
        };
        let external = ExternalTarget {
            tls: es.tls_enabled(),
            server_name: es
                .networking
                .tls
                .as_ref()
                .and_then(|t| t.server_name.clone()),
            via_egress,
        };
        let entry = endpoints.entry(service.to_string()).or_default();
        if via_egress {
            for egress in &local_egresses {
                let (address, port) = egress.networking.advertised();
                entry.push(Endpoint {
                    target: address.to_string(),
                    port,
                    tags: es.tags.clone(),
                    weight: 1,
                    locality: None,
                    external: Some(external.clone()),
                });
            }
        } else {
            entry.push(Endpoint {
                target: host.to_string(),
                port,
                tags: es.tags.clone(),
                weight: 1,
                locality: None,
                external: Some(external),
            });
        }
    }
    endpoints
}

/// Resolves the most specific traffic route for each outbound service of a dataplane.
pub fn route_map(dataplane: &Dataplane, routes: &[PolicyRef]) -> BTreeMap<ServiceName, PolicyRef> {
    outbound_services(dataplane)
        .filter_map(|(service, tags)| {
            let route = policy_match::select_best_outbound(dataplane, tags, routes)?;
            Some((service.to_string(), route))
        })
        .collect()
}

/// Returns the selectors a dataplane may route to, keyed by the service each selects.
///
/// Outbounds without a traffic route are routed directly to their own tags.
pub fn destination_map(
    dataplane: &Dataplane,
    routes: &BTreeMap<ServiceName, PolicyRef>,
) -> DestinationMap {
    let mut destinations = DestinationMap::new();
    let mut add = |service: &str, selector: TagSelector| {
        let selectors = destinations.entry(service.to_string()).or_default();
        if !selectors.contains(&selector) {
            selectors.push(selector);
        }
    };

    for (service, tags) in outbound_services(dataplane) {
        let splits = routes.get(service).and_then(|route| match &route.spec.conf {
            PolicyConf::TrafficRoute(conf) if !conf.split.is_empty() => Some(&conf.split),
            _ => None,
        });
        match splits {
            Some(splits) => {
                for split in splits {
                    if let Some(target) = split.destination.service_name() {
                        add(target, split.destination.clone());
                    }
                }
            }
            None => add(service, TagSelector::from(tags)),
        }
    }
    destinations
}

/// Returns the endpoints selected by a destination map.
pub fn filter_endpoints(endpoints: &EndpointMap, destinations: &DestinationMap) -> EndpointMap {
    destinations
        .iter()
        .filter_map(|(service, selectors)| {
            let selected = endpoints
                .get(service)?
                .iter()
                .filter(|ep| selectors.iter().any(|s| s.matches(&ep.tags)))
                .cloned()
                .collect::<Vec<_>>();
            if selected.is_empty() {
                return None;
            }
            Some((service.clone(), selected))
        })
        .collect()
}

fn outbound_services(dataplane: &Dataplane) -> impl Iterator<Item = (&str, &Tags)> {
    dataplane.networking.outbound.iter().filter_map(move |outbound| {
        let service = outbound.tags.service()?;
        if !dataplane.reaches(service) {
            return None;
        }
        Some((service, &outbound.tags))
    })
}

fn locality(mesh: &MeshSpec, zone: &str, local_zone: &str) -> Option<Locality> {
    if !mesh.locality_aware_lb() {
        return None;
    }
    Some(Locality {
        zone: zone.to_string(),
        priority: if zone == local_zone { 0 } else { 1 },
    })
}
