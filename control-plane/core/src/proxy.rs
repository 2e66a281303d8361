use crate::{
    dataplane::InboundInterface,
    mesh::LoggingBackend,
    policy_match::PolicyRef,
    resource::{
        DataplaneResource, ExternalServiceResource, MeshResource, ResourceKey,
        ZoneEgressResource, ZoneIngressResource,
    },
    tags::{TagSelector, Tags},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

pub type ServiceName = String;

/// Endpoints by service name.
pub type EndpointMap = BTreeMap<ServiceName, Vec<Endpoint>>;

/// The selectors a proxy may route to, by service name.
pub type DestinationMap = BTreeMap<ServiceName, Vec<TagSelector>>;

/// The stable identity of a data-plane proxy, in the form `{mesh}.{name}`.
///
/// Zone proxies are not scoped to a mesh and have an empty mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId {
    pub mesh: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid proxy id: {0:?}")]
pub struct InvalidProxyId(String);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProxyType {
    #[default]
    Sidecar,
    Gateway,
    Ingress,
    Egress,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown proxy type: {0:?}")]
pub struct UnknownProxyType(String);

/// Describes a proxy as reported by the proxy itself when it connects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataplaneMetadata {
    #[serde(default, with = "proxy_type_serde")]
    pub proxy_type: ProxyType,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub admin_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub target: String,
    pub port: u16,
    pub tags: Tags,
    pub weight: u32,
    pub locality: Option<Locality>,

    /// Set for endpoints of external services.
    pub external: Option<ExternalTarget>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locality {
    pub zone: String,
    pub priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalTarget {
    pub tls: bool,
    pub server_name: Option<String>,

    /// Traffic is sent through a zone egress rather than directly.
    pub via_egress: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routing {
    /// The traffic route that applies to each outbound service.
    pub traffic_routes: BTreeMap<ServiceName, PolicyRef>,
    pub outbound_targets: EndpointMap,
    pub external_service_targets: EndpointMap,
}

/// The policies that apply to a single dataplane.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchedPolicies {
    pub traffic_permissions: BTreeMap<InboundInterface, Vec<PolicyRef>>,
    pub fault_injections: BTreeMap<InboundInterface, Vec<PolicyRef>>,
    pub rate_limits_inbound: BTreeMap<InboundInterface, Vec<PolicyRef>>,
    pub rate_limits_outbound: BTreeMap<ServiceName, PolicyRef>,
    pub traffic_logs: BTreeMap<ServiceName, LoggingBackend>,
    pub timeouts: BTreeMap<ServiceName, PolicyRef>,
    pub health_checks: BTreeMap<ServiceName, PolicyRef>,
    pub circuit_breakers: BTreeMap<ServiceName, PolicyRef>,
    pub retries: BTreeMap<ServiceName, PolicyRef>,
    pub traffic_routes: BTreeMap<ServiceName, PolicyRef>,
    pub proxy_template: Option<PolicyRef>,
}

/// Everything needed to generate the configuration of one proxy, built once per
/// reconciliation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Proxy {
    pub id: ProxyId,
    pub metadata: DataplaneMetadata,
    pub zone: String,
    pub kind: ProxyKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProxyKind {
    Dataplane(Box<DataplaneProxy>),
    Ingress(IngressProxy),
    Egress(EgressProxy),
}

/// A sidecar or a gateway.
#[derive(Clone, Debug, PartialEq)]
pub struct DataplaneProxy {
    pub dataplane: Arc<DataplaneResource>,
    pub mesh: Arc<MeshResource>,
    pub routing: Routing,
    pub destinations: DestinationMap,
    pub policies: MatchedPolicies,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngressProxy {
    pub zone_ingress: Arc<ZoneIngressResource>,
    pub meshes: Vec<IngressMeshResources>,
}

/// The part of a mesh a zone ingress fronts.
#[derive(Clone, Debug, PartialEq)]
pub struct IngressMeshResources {
    pub mesh: Arc<MeshResource>,
    pub endpoints: EndpointMap,
    pub traffic_routes: Vec<PolicyRef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EgressProxy {
    pub zone_egress: Arc<ZoneEgressResource>,
    pub meshes: Vec<EgressMeshResources>,
}

/// The external services of a mesh reachable through a zone egress, with their policies keyed
/// by external service name.
#[derive(Clone, Debug, PartialEq)]
pub struct EgressMeshResources {
    pub mesh: Arc<MeshResource>,
    pub external_services: Vec<Arc<ExternalServiceResource>>,
    pub traffic_permissions: BTreeMap<ServiceName, Vec<PolicyRef>>,
    pub fault_injections: BTreeMap<ServiceName, Vec<PolicyRef>>,
    pub rate_limits: BTreeMap<ServiceName, Vec<PolicyRef>>,
}

/// Applies built proxies to the proxies themselves.
pub trait Reconcile: Send + Sync + 'static {
    /// Generates and publishes configuration for the proxy. Returns true if the published
    /// configuration changed.
    fn reconcile(&self, proxy: &Proxy) -> Result<bool>;

    /// Withdraws all configuration published for the proxy.
    fn clear(&self, id: &ProxyId);

    /// Returns true if credentials issued to the proxy must be renewed soon.
    fn credentials_expiring(&self, _id: &ProxyId) -> bool {
        false
    }
}

// === impl ProxyId ===

impl ProxyId {
    pub fn new(mesh: impl ToString, name: impl ToString) -> Self {
        Self {
            mesh: mesh.to_string(),
            name: name.to_string(),
        }
    }

    /// The key of the proxy's resource in the store.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.mesh, &self.name)
    }
}

impl FromStr for ProxyId {
    type Err = InvalidProxyId;

    fn from_str(s: &str) -> Result<Self, InvalidProxyId> {
        match s.split_once('.') {
            Some((mesh, name)) if !name.is_empty() => Ok(Self::new(mesh, name)),
            _ => Err(InvalidProxyId(s.to_string())),
        }
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.mesh, self.name)
    }
}

// === impl ProxyType ===

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sidecar => "sidecar",
            Self::Gateway => "gateway",
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }

    pub fn is_zone_proxy(&self) -> bool {
        matches!(self, Self::Ingress | Self::Egress)
    }
}

impl FromStr for ProxyType {
    type Err = UnknownProxyType;

    fn from_str(s: &str) -> Result<Self, UnknownProxyType> {
        match s {
            "" | "dataplane" | "sidecar" => Ok(Self::Sidecar),
            "gateway" => Ok(Self::Gateway),
            "ingress" => Ok(Self::Ingress),
            "egress" => Ok(Self::Egress),
            s => Err(UnknownProxyType(s.to_string())),
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

mod proxy_type_serde {
    use super::ProxyType;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(pt: &ProxyType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(pt.as_str())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ProxyType, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(D::Error::custom)
    }
}

// === impl DataplaneMetadata ===

impl DataplaneMetadata {
    /// Reads metadata from the node metadata a proxy sends with its discovery requests.
    ///
    /// Malformed metadata is logged and treated as absent.
    pub fn from_node_metadata(metadata: &serde_json::Value) -> Self {
        if metadata.is_null() {
            return Self::default();
        }
        serde_json::from_value(metadata.clone()).unwrap_or_else(|error| {
            tracing::warn!(%error, "Invalid node metadata");
            Self::default()
        })
    }
}

// === impl Proxy ===

impl Proxy {
    pub fn proxy_type(&self) -> ProxyType {
        match &self.kind {
            ProxyKind::Dataplane(dp) if dp.dataplane.spec.is_gateway() => ProxyType::Gateway,
            ProxyKind::Dataplane(_) => ProxyType::Sidecar,
            ProxyKind::Ingress(_) => ProxyType::Ingress,
            ProxyKind::Egress(_) => ProxyType::Egress,
        }
    }

    pub fn as_dataplane(&self) -> Option<&DataplaneProxy> {
        match &self.kind {
            ProxyKind::Dataplane(dp) => Some(dp.as_ref()),
            _ => None,
        }
    }
}
