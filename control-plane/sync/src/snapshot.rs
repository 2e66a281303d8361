use crate::topology;
use ahash::AHashMap as HashMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use mesh_control_plane_core::{
    proxy::EndpointMap,
    resource::{
        DataplaneResource, ExternalServiceResource, Meta, MeshResource, ZoneEgressResource,
        ZoneIngressResource,
    },
    PolicyRef, Resource, ResourceType, Spec,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Every resource relevant to one mesh, with a fingerprint that changes whenever any of them
/// does.
///
/// Snapshots are immutable; a newer snapshot supersedes an older one.
#[derive(Debug)]
pub struct MeshSnapshot {
    mesh: Arc<MeshResource>,
    dataplanes: Vec<Arc<DataplaneResource>>,
    dataplanes_by_name: HashMap<String, Arc<DataplaneResource>>,
    external_services: Vec<Arc<ExternalServiceResource>>,
    zone_ingresses: Vec<Arc<ZoneIngressResource>>,
    zone_egresses: Vec<Arc<ZoneEgressResource>>,
    policies: HashMap<ResourceType, Vec<PolicyRef>>,
    endpoints: EndpointMap,
    external_endpoints: EndpointMap,
    hash: String,
}

/// The snapshots of every mesh plus the global zone resources, as seen by zone proxies.
#[derive(Debug)]
pub struct GlobalSnapshot {
    meshes: Vec<Arc<MeshSnapshot>>,
    zone_ingresses: Vec<Arc<ZoneIngressResource>>,
    zone_egresses: Vec<Arc<ZoneEgressResource>>,
    hash: String,
}

// === impl MeshSnapshot ===

impl MeshSnapshot {
    /// Builds a snapshot from a mesh and the resources listed for it. Dataplane addresses must
    /// already be resolved.
    pub fn new(mesh: MeshResource, resources: Vec<Resource>, local_zone: &str) -> Self {
        let hash = fingerprint(
            std::iter::once(line(ResourceType::Mesh, &mesh.meta, None)).chain(resources.iter().map(
                |r| {
                    let address = match &r.spec {
                        Spec::Dataplane(dp) => Some(dp.networking.address.as_str()),
                        _ => None,
                    };
                    line(r.resource_type(), &r.meta, address)
                },
            )),
        );

        let mut dataplanes = Vec::new();
        let mut external_services = Vec::new();
        let mut zone_ingresses = Vec::new();
        let mut zone_egresses = Vec::new();
        let mut policies = HashMap::<ResourceType, Vec<PolicyRef>>::new();
        for Resource { meta, spec } in resources {
            match spec {
                Spec::Dataplane(spec) => dataplanes.push(Arc::new(Resource { meta, spec })),
                Spec::ExternalService(spec) => {
                    external_services.push(Arc::new(Resource { meta, spec }))
                }
                Spec::ZoneIngress(spec) => zone_ingresses.push(Arc::new(Resource { meta, spec })),
                Spec::ZoneEgress(spec) => zone_egresses.push(Arc::new(Resource { meta, spec })),
                Spec::Policy(spec) => policies
                    .entry(spec.conf.resource_type())
                    .or_default()
                    .push(Arc::new(Resource { meta, spec })),
                Spec::Mesh(_) => {
                    tracing::debug!(name = %meta.name, "Ignoring nested mesh resource");
                }
            }
        }

        let mut endpoints = topology::inbound_endpoints(&mesh.spec, &dataplanes, local_zone);
        topology::add_ingress_endpoints(
            &mut endpoints,
            &mesh.meta.name,
            &mesh.spec,
            &zone_ingresses,
            local_zone,
        );
        let external_endpoints = topology::external_service_endpoints(
            &mesh.spec,
            &external_services,
            &zone_egresses,
            local_zone,
        );

        let dataplanes_by_name = dataplanes
            .iter()
            .map(|dp| (dp.meta.name.clone(), dp.clone()))
            .collect();

        Self {
            mesh: Arc::new(mesh),
            dataplanes,
            dataplanes_by_name,
            external_services,
            zone_ingresses,
            zone_egresses,
            policies,
            endpoints,
            external_endpoints,
            hash,
        }
    }

    pub fn name(&self) -> &str {
        &self.mesh.meta.name
    }

    pub fn mesh(&self) -> &Arc<MeshResource> {
        &self.mesh
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn dataplanes(&self) -> &[Arc<DataplaneResource>] {
        &self.dataplanes
    }

    pub fn dataplane(&self, name: &str) -> Option<&Arc<DataplaneResource>> {
        self.dataplanes_by_name.get(name)
    }

    pub fn external_services(&self) -> &[Arc<ExternalServiceResource>] {
        &self.external_services
    }

    pub fn zone_ingresses(&self) -> &[Arc<ZoneIngressResource>] {
        &self.zone_ingresses
    }

    pub fn zone_egresses(&self) -> &[Arc<ZoneEgressResource>] {
        &self.zone_egresses
    }

    /// Returns the policies of a type in store order.
    pub fn policies(&self, rtype: ResourceType) -> &[PolicyRef] {
        self.policies.get(&rtype).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Endpoints of dataplanes in the mesh and of services reachable through other zones.
    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    pub fn external_endpoints(&self) -> &EndpointMap {
        &self.external_endpoints
    }

    pub fn resource_count(&self, rtype: ResourceType) -> usize {
        match rtype {
            ResourceType::Mesh => 1,
            ResourceType::Dataplane => self.dataplanes.len(),
            ResourceType::ExternalService => self.external_services.len(),
            ResourceType::ZoneIngress => self.zone_ingresses.len(),
            ResourceType::ZoneEgress => self.zone_egresses.len(),
            rtype => self.policies(rtype).len(),
        }
    }
}

// === impl GlobalSnapshot ===

impl GlobalSnapshot {
    pub fn new(
        meshes: Vec<Arc<MeshSnapshot>>,
        zone_ingresses: Vec<ZoneIngressResource>,
        zone_egresses: Vec<ZoneEgressResource>,
    ) -> Self {
        let mesh_lines = meshes
            .iter()
            .map(|m| format!("{}|{}", m.name(), m.hash()));
        let ingress_lines = zone_ingresses
            .iter()
            .map(|zi| line(ResourceType::ZoneIngress, &zi.meta, None));
        let egress_lines = zone_egresses
            .iter()
            .map(|ze| line(ResourceType::ZoneEgress, &ze.meta, None));
        let hash = fingerprint(mesh_lines.chain(ingress_lines).chain(egress_lines));

        Self {
            meshes,
            zone_ingresses: zone_ingresses.into_iter().map(Arc::new).collect(),
            zone_egresses: zone_egresses.into_iter().map(Arc::new).collect(),
            hash,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn meshes(&self) -> &[Arc<MeshSnapshot>] {
        &self.meshes
    }

    pub fn zone_ingress(&self, name: &str) -> Option<&Arc<ZoneIngressResource>> {
        self.zone_ingresses.iter().find(|zi| zi.meta.name == name)
    }

    pub fn zone_egress(&self, name: &str) -> Option<&Arc<ZoneEgressResource>> {
        self.zone_egresses.iter().find(|ze| ze.meta.name == name)
    }
}

fn line(rtype: ResourceType, meta: &Meta, address: Option<&str>) -> String {
    format!(
        "{rtype}|{}|{}|{}|{}",
        meta.mesh,
        meta.name,
        meta.version,
        address.unwrap_or_default()
    )
}

/// Hashes lines independently of their order.
fn fingerprint(lines: impl IntoIterator<Item = String>) -> String {
    let mut lines = lines.into_iter().collect::<Vec<_>>();
    lines.sort_unstable();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    STANDARD.encode(hasher.finalize())
}
