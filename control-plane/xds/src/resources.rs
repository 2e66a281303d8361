//! Wire-level configuration resources served to proxies.
//!
//! Resources are plain data; the transport is responsible for encoding them.

use chrono::{DateTime, Utc};
use mesh_control_plane_core::policy::{
    CircuitBreakerConf, FaultAbort, FaultBandwidth, FaultDelay, HealthCheckConf, LoadBalancer,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The resource groups of a snapshot. Each group is versioned independently.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeUrl {
    Listener,
    Route,
    Cluster,
    Endpoint,
    Secret,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    Listener(Listener),
    Route(RouteConfiguration),
    Cluster(Cluster),
    Endpoint(ClusterLoadAssignment),
    Secret(Secret),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub direction: Direction,
    pub filter_chains: Vec<FilterChain>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterChain {
    pub name: String,

    /// Matches connections by TLS server name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_names: Vec<String>,

    /// Requires and terminates mutual TLS with the named secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsContext>,

    pub filters: Vec<Filter>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum Filter {
    /// Allows only the listed principals; an empty list denies everything.
    Rbac {
        policies: Vec<RbacPolicy>,
    },
    Fault {
        delay: Option<FaultDelay>,
        abort: Option<FaultAbort>,
        response_bandwidth: Option<FaultBandwidth>,
    },
    RateLimit {
        requests: u32,
        interval_ms: u64,
        status: Option<u16>,
    },
    HttpConnectionManager {
        stat_prefix: String,
        route_config: String,
        access_log: Option<AccessLog>,
        idle_timeout_ms: Option<u64>,
    },
    TcpProxy {
        stat_prefix: String,
        clusters: Vec<WeightedCluster>,
        access_log: Option<AccessLog>,
        idle_timeout_ms: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacPolicy {
    /// The policy that granted access.
    pub name: String,
    pub principals: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub backend: String,
    pub format: Option<String>,
    pub sink: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub clusters: Vec<WeightedCluster>,
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub per_try_timeout_ms: Option<u64>,
    pub retry_on: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub discovery: Discovery,
    pub connect_timeout_ms: u64,
    pub lb_policy: LoadBalancer,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakerConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsContext>,
}

/// How a cluster learns its endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discovery {
    /// Endpoints are served as a [`ClusterLoadAssignment`] of the same name.
    Eds,

    /// A single fixed endpoint, typically the local workload.
    Static { address: String, port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsContext {
    /// Secrets holding the identity certificate and the trusted CA bundle. Unset when the peer
    /// is outside the mesh.
    pub identity_secret: Option<String>,
    pub ca_secret: Option<String>,
    pub sni: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub zone: Option<String>,
    pub priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub kind: SecretKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretKind {
    IdentityCert(IdentityCert),
    CaBundle { backend: String },
}

/// An identity certificate issued to a proxy by the mesh's CA backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCert {
    pub backend: String,
    pub spiffe_ids: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Resources produced by generators, by group and name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceSet {
    groups: BTreeMap<TypeUrl, BTreeMap<String, Resource>>,
}

// === impl TypeUrl ===

impl TypeUrl {
    pub const ALL: [TypeUrl; 5] = [
        Self::Listener,
        Self::Route,
        Self::Cluster,
        Self::Endpoint,
        Self::Secret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            Self::Route => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            Self::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            Self::Endpoint => "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment",
            Self::Secret => "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
        }
    }

    /// A short name suitable for metric labels.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Route => "route",
            Self::Cluster => "cluster",
            Self::Endpoint => "endpoint",
            Self::Secret => "secret",
        }
    }
}

impl fmt::Display for TypeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Resource ===

impl Resource {
    pub fn name(&self) -> &str {
        match self {
            Self::Listener(l) => &l.name,
            Self::Route(r) => &r.name,
            Self::Cluster(c) => &c.name,
            Self::Endpoint(e) => &e.cluster_name,
            Self::Secret(s) => &s.name,
        }
    }

    pub fn type_url(&self) -> TypeUrl {
        match self {
            Self::Listener(_) => TypeUrl::Listener,
            Self::Route(_) => TypeUrl::Route,
            Self::Cluster(_) => TypeUrl::Cluster,
            Self::Endpoint(_) => TypeUrl::Endpoint,
            Self::Secret(_) => TypeUrl::Secret,
        }
    }
}

impl From<Listener> for Resource {
    fn from(l: Listener) -> Self {
        Self::Listener(l)
    }
}

impl From<RouteConfiguration> for Resource {
    fn from(r: RouteConfiguration) -> Self {
        Self::Route(r)
    }
}

impl From<Cluster> for Resource {
    fn from(c: Cluster) -> Self {
        Self::Cluster(c)
    }
}

impl From<ClusterLoadAssignment> for Resource {
    fn from(e: ClusterLoadAssignment) -> Self {
        Self::Endpoint(e)
    }
}

impl From<Secret> for Resource {
    fn from(s: Secret) -> Self {
        Self::Secret(s)
    }
}

// === impl Filter ===

impl Filter {
    /// The clusters a network filter forwards to.
    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        let clusters = match self {
            Self::TcpProxy { clusters, .. } => clusters.as_slice(),
            _ => &[],
        };
        clusters.iter().map(|c| c.name.as_str())
    }

    pub fn route_config(&self) -> Option<&str> {
        match self {
            Self::HttpConnectionManager { route_config, .. } => Some(route_config),
            _ => None,
        }
    }
}

// === impl ResourceSet ===

impl ResourceSet {
    /// Adds a resource, replacing any resource of the same group and name.
    pub fn add(&mut self, resource: impl Into<Resource>) {
        let resource = resource.into();
        self.groups
            .entry(resource.type_url())
            .or_default()
            .insert(resource.name().to_string(), resource);
    }

    /// Adds every resource of `other`, replacing resources with the same name.
    pub fn merge(&mut self, other: ResourceSet) {
        for (type_url, resources) in other.groups {
            self.groups.entry(type_url).or_default().extend(resources);
        }
    }

    pub fn get(&self, type_url: TypeUrl, name: &str) -> Option<&Resource> {
        self.groups.get(&type_url)?.get(name)
    }

    pub fn contains(&self, type_url: TypeUrl, name: &str) -> bool {
        self.get(type_url, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_groups(self) -> BTreeMap<TypeUrl, BTreeMap<String, Resource>> {
        self.groups
    }
}

impl<R: Into<Resource>> Extend<R> for ResourceSet {
    fn extend<I: IntoIterator<Item = R>>(&mut self, iter: I) {
        for resource in iter {
            self.add(resource);
        }
    }
}
