//! Expands a [`Proxy`] into the resources of its configuration.
//!
//! Generators are grouped into named profiles. Sidecars use the `default-proxy` profile unless
//! a proxy template imports other profiles; the other proxy types each have a fixed profile.

mod egress;
mod gateway;
mod inbound;
mod ingress;
mod outbound;
mod secrets;

pub use self::{
    egress::EgressGenerator, gateway::GatewayGenerator, inbound::InboundGenerator,
    ingress::IngressGenerator, outbound::OutboundGenerator, secrets::SecretsGenerator,
};

use crate::{
    resources::{AccessLog, ClusterLoadAssignment, LbEndpoint, ResourceSet, TlsContext},
    secrets::Secrets,
    Error,
};
use ahash::AHashMap as HashMap;
use mesh_control_plane_core::{
    mesh::{LogSink, LoggingBackend},
    policy::PolicyConf,
    proxy::Endpoint,
    Proxy, ProxyType, TagSelector, MATCH_ALL, SERVICE_TAG,
};
use std::sync::Arc;

pub const DEFAULT_PROXY: &str = "default-proxy";
pub const GATEWAY_PROXY: &str = "gateway-proxy";
pub const INGRESS_PROXY: &str = "ingress-proxy";
pub const EGRESS_PROXY: &str = "egress-proxy";

pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Contributes part of a proxy's configuration.
pub trait ResourceGenerator: Send + Sync + 'static {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error>;
}

/// Runs generators in order. Later generators replace resources of the same name.
#[derive(Clone, Default)]
pub struct CompositeGenerator(Vec<Arc<dyn ResourceGenerator>>);

/// Selects the profiles that apply to a proxy and runs them.
#[derive(Clone)]
pub struct ProfileGenerator {
    profiles: HashMap<String, CompositeGenerator>,
}

// === impl CompositeGenerator ===

impl CompositeGenerator {
    pub fn new(generators: impl IntoIterator<Item = Arc<dyn ResourceGenerator>>) -> Self {
        Self(generators.into_iter().collect())
    }
}

impl ResourceGenerator for CompositeGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        for generator in &self.0 {
            resources.merge(generator.generate(proxy)?);
        }
        Ok(resources)
    }
}

// === impl ProfileGenerator ===

impl ProfileGenerator {
    /// Creates a generator with the built-in profiles.
    pub fn new(secrets: Arc<Secrets>) -> Self {
        let outbound: Arc<dyn ResourceGenerator> = Arc::new(OutboundGenerator);
        let dataplane_secrets: Arc<dyn ResourceGenerator> =
            Arc::new(SecretsGenerator::new(secrets.clone()));

        let mut profiles = HashMap::default();
        profiles.insert(
            DEFAULT_PROXY.to_string(),
            CompositeGenerator::new([
                Arc::new(InboundGenerator) as Arc<dyn ResourceGenerator>,
                outbound.clone(),
                dataplane_secrets.clone(),
            ]),
        );
        profiles.insert(
            GATEWAY_PROXY.to_string(),
            CompositeGenerator::new([
                Arc::new(GatewayGenerator) as Arc<dyn ResourceGenerator>,
                outbound,
                dataplane_secrets,
            ]),
        );
        profiles.insert(
            INGRESS_PROXY.to_string(),
            CompositeGenerator::new([Arc::new(IngressGenerator) as Arc<dyn ResourceGenerator>]),
        );
        profiles.insert(
            EGRESS_PROXY.to_string(),
            CompositeGenerator::new([
                Arc::new(EgressGenerator::new(secrets)) as Arc<dyn ResourceGenerator>
            ]),
        );
        Self { profiles }
    }

    /// Registers an additional profile, replacing any profile of the same name.
    pub fn with_profile(mut self, name: impl Into<String>, profile: CompositeGenerator) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }

    fn profile_names(proxy: &Proxy) -> Vec<&str> {
        match proxy.proxy_type() {
            ProxyType::Sidecar => {
                let imports = proxy
                    .as_dataplane()
                    .and_then(|dp| dp.policies.proxy_template.as_ref())
                    .and_then(|template| match &template.spec.conf {
                        PolicyConf::ProxyTemplate(conf) if !conf.imports.is_empty() => {
                            Some(conf.imports.iter().map(String::as_str).collect())
                        }
                        _ => None,
                    });
                imports.unwrap_or_else(|| vec![DEFAULT_PROXY])
            }
            ProxyType::Gateway => vec![GATEWAY_PROXY],
            ProxyType::Ingress => vec![INGRESS_PROXY],
            ProxyType::Egress => vec![EGRESS_PROXY],
        }
    }
}

impl ResourceGenerator for ProfileGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        for name in Self::profile_names(proxy) {
            let profile = self
                .profiles
                .get(name)
                .ok_or_else(|| Error::UnknownProfile(name.to_string()))?;
            resources.merge(profile.generate(proxy)?);
        }
        Ok(resources)
    }
}

impl std::fmt::Debug for ProfileGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.profiles.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("ProfileGenerator")
            .field("profiles", &names)
            .finish()
    }
}

// === naming ===

/// Names the cluster of a destination selector: the service, followed by any other tags.
pub(crate) fn cluster_name(selector: &TagSelector) -> String {
    let mut name = selector.service_name().unwrap_or(MATCH_ALL).to_string();
    for (key, value) in selector.iter() {
        if key != SERVICE_TAG {
            name.push_str(&format!("_{key}-{value}"));
        }
    }
    name
}

pub(crate) fn spiffe_id(mesh: &str, service: &str) -> String {
    format!("spiffe://{mesh}/{service}")
}

pub(crate) fn identity_secret(mesh: &str) -> String {
    format!("identity_cert:secret:{mesh}")
}

pub(crate) fn ca_secret(mesh: &str) -> String {
    format!("mesh_ca:secret:{mesh}")
}

/// Terminates or originates mesh mTLS with the mesh's secrets.
pub(crate) fn mesh_tls(mesh: &str, sni: Option<String>) -> TlsContext {
    TlsContext {
        identity_secret: Some(identity_secret(mesh)),
        ca_secret: Some(ca_secret(mesh)),
        sni,
    }
}

pub(crate) fn load_assignment<'e>(
    cluster_name: impl Into<String>,
    endpoints: impl IntoIterator<Item = &'e Endpoint>,
) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster_name.into(),
        endpoints: endpoints
            .into_iter()
            .map(|ep| LbEndpoint {
                address: ep.target.clone(),
                port: ep.port,
                weight: ep.weight,
                zone: ep.locality.as_ref().map(|l| l.zone.clone()),
                priority: ep.locality.as_ref().map(|l| l.priority).unwrap_or(0),
            })
            .collect(),
    }
}

pub(crate) fn access_log(backend: &LoggingBackend) -> AccessLog {
    AccessLog {
        backend: backend.name.clone(),
        format: backend.format.clone(),
        sink: match &backend.sink {
            LogSink::File { path } => format!("file:{path}"),
            LogSink::Tcp { address } => format!("tcp:{address}"),
        },
    }
}

/// Converts policy sources into the principals allowed by mesh mTLS.
pub(crate) fn principals<'s>(
    mesh: &str,
    sources: impl IntoIterator<Item = &'s TagSelector>,
) -> Vec<String> {
    let mut principals = sources
        .into_iter()
        .map(|source| spiffe_id(mesh, source.get(SERVICE_TAG).unwrap_or(MATCH_ALL)))
        .collect::<Vec<_>>();
    principals.sort();
    principals.dedup();
    principals
}
