use crate::{
    snapshot::{GlobalSnapshot, MeshSnapshot},
    topology, Error,
};
use mesh_control_plane_core::{
    dataplane::Dataplane,
    policy::PolicyConf,
    policy_match::{self, PolicyRef},
    proxy::{
        DataplaneProxy, DestinationMap, EgressMeshResources, EgressProxy, IngressMeshResources,
        IngressProxy, MatchedPolicies, Routing, ServiceName,
    },
    DataplaneMetadata, Proxy, ProxyId, ProxyKind, ProxyType, ResourceKey, ResourceType, Tags,
    SERVICE_TAG,
};
use std::{collections::BTreeMap, sync::Arc};

/// The resources a proxy is built from: a single mesh for dataplanes, every mesh for zone
/// proxies.
#[derive(Clone, Debug)]
pub enum MeshContext {
    Mesh(Arc<MeshSnapshot>),
    Global(Arc<GlobalSnapshot>),
}

/// Builds the [`Proxy`] descriptor of a connected proxy.
pub trait BuildProxy: Send + Sync + 'static {
    fn build(
        &self,
        id: &ProxyId,
        metadata: &DataplaneMetadata,
        ctx: &MeshContext,
    ) -> Result<Proxy, Error>;
}

#[derive(Clone, Debug)]
pub struct ProxyBuilder {
    zone: String,
}

// === impl MeshContext ===

impl MeshContext {
    pub fn hash(&self) -> &str {
        match self {
            Self::Mesh(mesh) => mesh.hash(),
            Self::Global(global) => global.hash(),
        }
    }
}

// === impl ProxyBuilder ===

impl ProxyBuilder {
    pub fn new(zone: impl Into<String>) -> Self {
        Self { zone: zone.into() }
    }

    fn build_dataplane(
        &self,
        id: &ProxyId,
        metadata: &DataplaneMetadata,
        mesh: &MeshSnapshot,
    ) -> Result<Proxy, Error> {
        let dataplane = mesh
            .dataplane(&id.name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::Dataplane, id.key()))?;
        let dp = &dataplane.spec;

        let traffic_routes = topology::route_map(dp, mesh.policies(ResourceType::TrafficRoute));
        let destinations = topology::destination_map(dp, &traffic_routes);
        let routing = Routing {
            outbound_targets: topology::filter_endpoints(mesh.endpoints(), &destinations),
            external_service_targets: topology::filter_endpoints(
                mesh.external_endpoints(),
                &destinations,
            ),
            traffic_routes: traffic_routes.clone(),
        };
        let policies = match_policies(dp, mesh, &destinations, traffic_routes);

        Ok(Proxy {
            id: id.clone(),
            metadata: metadata.clone(),
            zone: self.zone.clone(),
            kind: ProxyKind::Dataplane(Box::new(DataplaneProxy {
                mesh: mesh.mesh().clone(),
                dataplane,
                routing,
                destinations,
                policies,
            })),
        })
    }

    fn build_ingress(
        &self,
        id: &ProxyId,
        metadata: &DataplaneMetadata,
        global: &GlobalSnapshot,
    ) -> Result<Proxy, Error> {
        let zone_ingress = global
            .zone_ingress(&id.name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::ZoneIngress, ResourceKey::global(&id.name)))?;

        // Other zones reach this zone's services over mTLS only.
        let meshes = global
            .meshes()
            .iter()
            .filter(|mesh| mesh.mesh().spec.mtls_enabled())
            .filter_map(|mesh| {
                let endpoints =
                    topology::inbound_endpoints(&mesh.mesh().spec, mesh.dataplanes(), &self.zone);
                if endpoints.is_empty() {
                    return None;
                }
                Some(IngressMeshResources {
                    mesh: mesh.mesh().clone(),
                    endpoints,
                    traffic_routes: mesh.policies(ResourceType::TrafficRoute).to_vec(),
                })
            })
            .collect();

        Ok(Proxy {
            id: id.clone(),
            metadata: metadata.clone(),
            zone: self.zone.clone(),
            kind: ProxyKind::Ingress(IngressProxy {
                zone_ingress,
                meshes,
            }),
        })
    }

    fn build_egress(
        &self,
        id: &ProxyId,
        metadata: &DataplaneMetadata,
        global: &GlobalSnapshot,
    ) -> Result<Proxy, Error> {
        let zone_egress = global
            .zone_egress(&id.name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::ZoneEgress, ResourceKey::global(&id.name)))?;

        let meshes = global
            .meshes()
            .iter()
            .filter(|mesh| mesh.mesh().spec.zone_egress_enabled())
            .map(|mesh| {
                let mut resources = EgressMeshResources {
                    mesh: mesh.mesh().clone(),
                    external_services: mesh.external_services().to_vec(),
                    traffic_permissions: BTreeMap::new(),
                    fault_injections: BTreeMap::new(),
                    rate_limits: BTreeMap::new(),
                };
                for es in mesh.external_services() {
                    let Some(service) = es.spec.service() else {
                        continue;
                    };
                    let tags = &es.spec.tags;
                    insert_nonempty(
                        &mut resources.traffic_permissions,
                        service.to_string(),
                        policy_match::collect_all(
                            tags,
                            mesh.policies(ResourceType::TrafficPermission),
                        ),
                    );
                    insert_nonempty(
                        &mut resources.fault_injections,
                        service.to_string(),
                        policy_match::collect_by_specificity(
                            tags,
                            mesh.policies(ResourceType::FaultInjection),
                        ),
                    );
                    insert_nonempty(
                        &mut resources.rate_limits,
                        service.to_string(),
                        policy_match::collect_by_specificity(
                            tags,
                            mesh.policies(ResourceType::RateLimit),
                        ),
                    );
                }
                resources
            })
            .collect();

        Ok(Proxy {
            id: id.clone(),
            metadata: metadata.clone(),
            zone: self.zone.clone(),
            kind: ProxyKind::Egress(EgressProxy {
                zone_egress,
                meshes,
            }),
        })
    }
}

impl BuildProxy for ProxyBuilder {
    fn build(
        &self,
        id: &ProxyId,
        metadata: &DataplaneMetadata,
        ctx: &MeshContext,
    ) -> Result<Proxy, Error> {
        match (metadata.proxy_type, ctx) {
            (ProxyType::Sidecar | ProxyType::Gateway, MeshContext::Mesh(mesh)) => {
                self.build_dataplane(id, metadata, mesh)
            }
            (ProxyType::Ingress, MeshContext::Global(global)) => {
                self.build_ingress(id, metadata, global)
            }
            (ProxyType::Egress, MeshContext::Global(global)) => {
                self.build_egress(id, metadata, global)
            }
            (proxy_type, _) => Err(Error::UnexpectedContext(proxy_type)),
        }
    }
}

/// Resolves every policy that applies to a dataplane. Gateways have no inbound policies.
fn match_policies(
    dp: &Dataplane,
    mesh: &MeshSnapshot,
    destinations: &DestinationMap,
    traffic_routes: BTreeMap<ServiceName, PolicyRef>,
) -> MatchedPolicies {
    let mut matched = MatchedPolicies::default();

    if !dp.is_gateway() {
        for inbound in &dp.networking.inbound {
            let iface = dp.inbound_interface(inbound);
            let tags = &inbound.tags;
            insert_nonempty(
                &mut matched.traffic_permissions,
                iface.clone(),
                policy_match::collect_all(tags, mesh.policies(ResourceType::TrafficPermission)),
            );
            insert_nonempty(
                &mut matched.fault_injections,
                iface.clone(),
                policy_match::collect_by_specificity(
                    tags,
                    mesh.policies(ResourceType::FaultInjection),
                ),
            );
            insert_nonempty(
                &mut matched.rate_limits_inbound,
                iface,
                policy_match::collect_by_specificity(tags, mesh.policies(ResourceType::RateLimit)),
            );
        }
    }

    for service in destinations.keys() {
        let tags = Tags::from([(SERVICE_TAG, service.as_str())]);
        let best = |rtype| policy_match::select_best_outbound(dp, &tags, mesh.policies(rtype));

        if let Some(p) = best(ResourceType::Timeout) {
            matched.timeouts.insert(service.clone(), p);
        }
        if let Some(p) = best(ResourceType::HealthCheck) {
            matched.health_checks.insert(service.clone(), p);
        }
        if let Some(p) = best(ResourceType::CircuitBreaker) {
            matched.circuit_breakers.insert(service.clone(), p);
        }
        if let Some(p) = best(ResourceType::Retry) {
            matched.retries.insert(service.clone(), p);
        }
        if let Some(p) = best(ResourceType::RateLimit) {
            matched.rate_limits_outbound.insert(service.clone(), p);
        }
        if let Some(p) = best(ResourceType::TrafficLog) {
            let PolicyConf::TrafficLog(conf) = &p.spec.conf else {
                continue;
            };
            match mesh.mesh().spec.logging_backend(conf.backend.as_deref()) {
                Some(backend) => {
                    matched.traffic_logs.insert(service.clone(), backend.clone());
                }
                None => tracing::debug!(
                    policy = %p.name(),
                    backend = ?conf.backend,
                    "Traffic log refers to an unknown logging backend",
                ),
            }
        }
    }

    matched.traffic_routes = traffic_routes;
    matched.proxy_template =
        policy_match::select_best_for_dataplane(dp, mesh.policies(ResourceType::ProxyTemplate));
    matched
}

fn insert_nonempty<K: Ord>(map: &mut BTreeMap<K, Vec<PolicyRef>>, key: K, policies: Vec<PolicyRef>) {
    if !policies.is_empty() {
        map.insert(key, policies);
    }
}

#[cfg(test)]
mod tests;
