use crate::{
    dataplane::{Dataplane, ExternalService, ZoneEgress, ZoneIngress},
    mesh::MeshSpec,
    policy::{Policy, PolicyConf},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every kind of resource the control plane reads from the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Mesh,
    Dataplane,
    ZoneIngress,
    ZoneEgress,
    ExternalService,
    TrafficPermission,
    TrafficRoute,
    TrafficLog,
    FaultInjection,
    RateLimit,
    Timeout,
    HealthCheck,
    CircuitBreaker,
    Retry,
    ProxyTemplate,
}

/// Identifies a resource within its type.
///
/// Global resources (meshes, zone ingresses and egresses) have an empty mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub mesh: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub mesh: String,
    pub name: String,

    /// An opaque version assigned by the store; it changes on every write.
    pub version: String,

    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

/// A stored resource. Untyped resources carry a [`Spec`]; typed views carry the spec of a
/// single kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource<S = Spec> {
    pub meta: Meta,
    pub spec: S,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Spec {
    Mesh(MeshSpec),
    Dataplane(Dataplane),
    ZoneIngress(ZoneIngress),
    ZoneEgress(ZoneEgress),
    ExternalService(ExternalService),
    Policy(Policy),
}

pub type MeshResource = Resource<MeshSpec>;
pub type DataplaneResource = Resource<Dataplane>;
pub type ZoneIngressResource = Resource<ZoneIngress>;
pub type ZoneEgressResource = Resource<ZoneEgress>;
pub type ExternalServiceResource = Resource<ExternalService>;
pub type PolicyResource = Resource<Policy>;

// === impl ResourceType ===

impl ResourceType {
    pub const ALL: [Self; 15] = [
        Self::Mesh,
        Self::Dataplane,
        Self::ZoneIngress,
        Self::ZoneEgress,
        Self::ExternalService,
        Self::TrafficPermission,
        Self::TrafficRoute,
        Self::TrafficLog,
        Self::FaultInjection,
        Self::RateLimit,
        Self::Timeout,
        Self::HealthCheck,
        Self::CircuitBreaker,
        Self::Retry,
        Self::ProxyTemplate,
    ];

    pub const POLICIES: [Self; 10] = [
        Self::TrafficPermission,
        Self::TrafficRoute,
        Self::TrafficLog,
        Self::FaultInjection,
        Self::RateLimit,
        Self::Timeout,
        Self::HealthCheck,
        Self::CircuitBreaker,
        Self::Retry,
        Self::ProxyTemplate,
    ];

    /// Global resources are not scoped to a mesh.
    pub fn is_global(self) -> bool {
        matches!(self, Self::Mesh | Self::ZoneIngress | Self::ZoneEgress)
    }

    pub fn is_policy(self) -> bool {
        Self::POLICIES.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mesh => "Mesh",
            Self::Dataplane => "Dataplane",
            Self::ZoneIngress => "ZoneIngress",
            Self::ZoneEgress => "ZoneEgress",
            Self::ExternalService => "ExternalService",
            Self::TrafficPermission => "TrafficPermission",
            Self::TrafficRoute => "TrafficRoute",
            Self::TrafficLog => "TrafficLog",
            Self::FaultInjection => "FaultInjection",
            Self::RateLimit => "RateLimit",
            Self::Timeout => "Timeout",
            Self::HealthCheck => "HealthCheck",
            Self::CircuitBreaker => "CircuitBreaker",
            Self::Retry => "Retry",
            Self::ProxyTemplate => "ProxyTemplate",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn new(mesh: impl ToString, name: impl ToString) -> Self {
        Self {
            mesh: mesh.to_string(),
            name: name.to_string(),
        }
    }

    pub fn global(name: impl ToString) -> Self {
        Self::new("", name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mesh.is_empty() {
            self.name.fmt(f)
        } else {
            write!(f, "{}/{}", self.mesh, self.name)
        }
    }
}

// === impl Meta ===

impl Meta {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.mesh, &self.name)
    }
}

// === impl Resource ===

impl<S> Resource<S> {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn mesh(&self) -> &str {
        &self.meta.mesh
    }

    pub fn key(&self) -> ResourceKey {
        self.meta.key()
    }
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        self.spec.resource_type()
    }

    pub fn into_mesh(self) -> Option<MeshResource> {
        let Self { meta, spec } = self;
        match spec {
            Spec::Mesh(spec) => Some(Resource { meta, spec }),
            _ => None,
        }
    }

    pub fn into_dataplane(self) -> Option<DataplaneResource> {
        let Self { meta, spec } = self;
        match spec {
            Spec::Dataplane(spec) => Some(Resource { meta, spec }),
            _ => None,
        }
    }

    pub fn into_zone_ingress(self) -> Option<ZoneIngressResource> {
        let Self { meta, spec } = self;
        match spec {
            Spec::ZoneIngress(spec) => Some(Resource { meta, spec }),
            _ => None,
        }
    }

    pub fn into_zone_egress(self) -> Option<ZoneEgressResource> {
        let Self { meta, spec } = self;
        match spec {
            Spec::ZoneEgress(spec) => Some(Resource { meta, spec }),
            _ => None,
        }
    }

    pub fn into_external_service(self) -> Option<ExternalServiceResource> {
        let Self { meta, spec } = self;
        match spec {
            Spec::ExternalService(spec) => Some(Resource { meta, spec }),
            _ => None,
        }
    }

    pub fn into_policy(self) -> Option<PolicyResource> {
        let Self { meta, spec } = self;
        match spec {
            Spec::Policy(spec) => Some(Resource { meta, spec }),
            _ => None,
        }
    }
}

// === impl Spec ===

impl Spec {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Mesh(_) => ResourceType::Mesh,
            Self::Dataplane(_) => ResourceType::Dataplane,
            Self::ZoneIngress(_) => ResourceType::ZoneIngress,
            Self::ZoneEgress(_) => ResourceType::ZoneEgress,
            Self::ExternalService(_) => ResourceType::ExternalService,
            Self::Policy(policy) => policy.conf.resource_type(),
        }
    }

    /// Decodes a spec of the given type from a JSON document.
    ///
    /// Policies are documents of the form `{"sources": [...], "destinations": [...], "conf": {...}}`
    /// where the shape of `conf` depends on the policy type.
    pub fn from_json(rtype: ResourceType, value: serde_json::Value) -> serde_json::Result<Self> {
        use serde_json::from_value;

        #[derive(Deserialize)]
        struct RawPolicy {
            #[serde(default)]
            sources: Vec<crate::TagSelector>,
            #[serde(default)]
            destinations: Vec<crate::TagSelector>,
            #[serde(default)]
            conf: serde_json::Value,
        }

        let spec = match rtype {
            ResourceType::Mesh => Self::Mesh(from_value(value)?),
            ResourceType::Dataplane => Self::Dataplane(from_value(value)?),
            ResourceType::ZoneIngress => Self::ZoneIngress(from_value(value)?),
            ResourceType::ZoneEgress => Self::ZoneEgress(from_value(value)?),
            ResourceType::ExternalService => Self::ExternalService(from_value(value)?),
            policy => {
                let RawPolicy {
                    sources,
                    destinations,
                    conf,
                } = from_value(value)?;
                Self::Policy(Policy {
                    sources,
                    destinations,
                    conf: PolicyConf::from_json(policy, conf)?,
                })
            }
        };
        Ok(spec)
    }
}

impl From<MeshSpec> for Spec {
    fn from(spec: MeshSpec) -> Self {
        Self::Mesh(spec)
    }
}

impl From<Dataplane> for Spec {
    fn from(spec: Dataplane) -> Self {
        Self::Dataplane(spec)
    }
}

impl From<ZoneIngress> for Spec {
    fn from(spec: ZoneIngress) -> Self {
        Self::ZoneIngress(spec)
    }
}

impl From<ZoneEgress> for Spec {
    fn from(spec: ZoneEgress) -> Self {
        Self::ZoneEgress(spec)
    }
}

impl From<ExternalService> for Spec {
    fn from(spec: ExternalService) -> Self {
        Self::ExternalService(spec)
    }
}

impl From<Policy> for Spec {
    fn from(spec: Policy) -> Self {
        Self::Policy(spec)
    }
}
