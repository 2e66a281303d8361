use crate::{
    snapshot::{GlobalSnapshot, MeshSnapshot},
    Error,
};
use ahash::AHashMap as HashMap;
use futures::{
    future::{BoxFuture, Shared},
    prelude::*,
};
use mesh_control_plane_core::{
    Resource, ResourceKey, ResourceStore, ResourceType, Spec,
};
use parking_lot::Mutex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::{net::IpAddr, sync::Arc};
use tokio::time;

/// Resolves DNS names of dataplane addresses.
#[async_trait::async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr>;
}

/// Resolves names with the system resolver.
#[derive(Copy, Clone, Debug, Default)]
pub struct DnsResolver;

/// Caches mesh snapshots for a bounded time.
///
/// Concurrent requests for a mesh that is not cached share a single build. Failed builds are
/// not cached.
#[derive(Clone)]
pub struct MeshCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ResourceStore>,
    resolver: Arc<dyn Resolve>,
    zone: String,
    expiration: time::Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_flight: u64,
    entries: HashMap<String, Entry>,
    flights: HashMap<String, Flight>,
}

struct Entry {
    snapshot: Arc<MeshSnapshot>,
    expires_at: time::Instant,
}

type Build = Shared<BoxFuture<'static, Result<Arc<MeshSnapshot>, Error>>>;

struct Flight {
    id: u64,
    build: Build,
}

#[derive(Debug)]
struct Instrumented(Arc<Inner>);

/// Resource types listed for every mesh snapshot. Zone proxies are global and listed without a
/// mesh filter.
const MESH_TYPES: [ResourceType; 14] = [
    ResourceType::Dataplane,
    ResourceType::ZoneIngress,
    ResourceType::ZoneEgress,
    ResourceType::ExternalService,
    ResourceType::TrafficPermission,
    ResourceType::TrafficRoute,
    ResourceType::TrafficLog,
    ResourceType::FaultInjection,
    ResourceType::RateLimit,
    ResourceType::Timeout,
    ResourceType::HealthCheck,
    ResourceType::CircuitBreaker,
    ResourceType::Retry,
    ResourceType::ProxyTemplate,
];

pub fn register(reg: &mut Registry, cache: &MeshCache) {
    reg.register_collector(Box::new(Instrumented(cache.inner.clone())));
}

// === impl DnsResolver ===

#[async_trait::async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"))
    }
}

// === impl MeshCache ===

impl MeshCache {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        resolver: Arc<dyn Resolve>,
        zone: impl Into<String>,
        expiration: time::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                resolver,
                zone: zone.into(),
                expiration,
                state: Default::default(),
            }),
        }
    }

    /// Returns the fingerprint of a mesh's resources.
    pub async fn hash(&self, mesh: &str) -> Result<String, Error> {
        let snapshot = self.snapshot(mesh).await?;
        Ok(snapshot.hash().to_string())
    }

    /// Returns a snapshot of a mesh, building it if the cached one is missing or expired.
    pub async fn snapshot(&self, mesh: &str) -> Result<Arc<MeshSnapshot>, Error> {
        let (id, build) = {
            let mut state = self.inner.state.lock();
            let now = time::Instant::now();
            if let Some(entry) = state.entries.get(mesh) {
                if entry.expires_at > now {
                    return Ok(entry.snapshot.clone());
                }
            }

            match state.flights.get(mesh) {
                Some(flight) => (flight.id, flight.build.clone()),
                None => {
                    // Meshes that are no longer requested, or no longer exist, are forgotten
                    // once they expire.
                    state.entries.retain(|_, entry| entry.expires_at > now);
                    let id = state.next_flight;
                    state.next_flight += 1;
                    let inner = self.inner.clone();
                    let name = mesh.to_string();
                    let build = async move { inner.build(&name).await.map(Arc::new) }
                        .boxed()
                        .shared();
                    state.flights.insert(
                        mesh.to_string(),
                        Flight {
                            id,
                            build: build.clone(),
                        },
                    );
                    (id, build)
                }
            }
        };

        let result = build.await;

        // The first waiter to finish retires the flight.
        let mut state = self.inner.state.lock();
        if state.flights.get(mesh).map(|f| f.id) == Some(id) {
            state.flights.remove(mesh);
            if let Ok(snapshot) = &result {
                state.entries.insert(
                    mesh.to_string(),
                    Entry {
                        snapshot: snapshot.clone(),
                        expires_at: time::Instant::now() + self.inner.expiration,
                    },
                );
            }
        }
        result
    }

    /// Returns the snapshots of every mesh together with the global zone resources.
    pub async fn global(&self) -> Result<Arc<GlobalSnapshot>, Error> {
        let store = &self.inner.store;
        let meshes = store.list(ResourceType::Mesh, None).await?;
        let mut snapshots = Vec::with_capacity(meshes.len());
        for mesh in meshes {
            match self.snapshot(&mesh.meta.name).await {
                Ok(snapshot) => snapshots.push(snapshot),
                // Deleted since it was listed.
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }
        let zone_ingresses = store
            .list(ResourceType::ZoneIngress, None)
            .await?
            .into_iter()
            .filter_map(Resource::into_zone_ingress)
            .collect();
        let zone_egresses = store
            .list(ResourceType::ZoneEgress, None)
            .await?
            .into_iter()
            .filter_map(Resource::into_zone_egress)
            .collect();
        Ok(Arc::new(GlobalSnapshot::new(
            snapshots,
            zone_ingresses,
            zone_egresses,
        )))
    }

    /// Drops the cached snapshot of a mesh so that the next request rebuilds it.
    ///
    /// A build already in flight may have read the store before the change; its result is still
    /// returned to its waiters but is never cached.
    pub fn invalidate(&self, mesh: &str) {
        let mut state = self.inner.state.lock();
        state.entries.remove(mesh);
        state.flights.remove(mesh);
    }

    pub fn cached_meshes(&self) -> usize {
        self.inner.state.lock().entries.len()
    }
}

// === impl Inner ===

impl Inner {
    async fn build(&self, mesh: &str) -> Result<MeshSnapshot, Error> {
        tracing::debug!(%mesh, "Building mesh snapshot");
        let mesh_resource = self
            .store
            .get(ResourceType::Mesh, &ResourceKey::global(mesh))
            .await?;
        let mesh_resource = mesh_resource.into_mesh().ok_or_else(|| {
            Error::not_found(ResourceType::Mesh, ResourceKey::global(mesh))
        })?;

        let mut resources = Vec::new();
        for rtype in MESH_TYPES {
            let filter = if rtype.is_global() { None } else { Some(mesh) };
            resources.extend(self.store.list(rtype, filter).await?);
        }

        for resource in &mut resources {
            if let Spec::Dataplane(dp) = &mut resource.spec {
                let address = &mut dp.networking.address;
                if address.parse::<IpAddr>().is_err() {
                    let ip = self
                        .resolver
                        .resolve(address)
                        .await
                        .map_err(|error| Error::Resolve {
                            host: address.clone(),
                            reason: error.to_string(),
                        })?;
                    *address = ip.to_string();
                }
            }
        }

        let snapshot = MeshSnapshot::new(mesh_resource, resources, &self.zone);
        tracing::debug!(%mesh, hash = %snapshot.hash(), "Built mesh snapshot");
        Ok(snapshot)
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCache")
            .field("zone", &self.zone)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let state = self.0.state.lock();

        let meshes_encoder = encoder.encode_descriptor(
            "cached_meshes",
            "The number of mesh snapshots in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(state.entries.len() as u32).encode(meshes_encoder)?;

        let flights_encoder = encoder.encode_descriptor(
            "builds_in_flight",
            "The number of mesh snapshots being built",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(state.flights.len() as u32).encode(flights_encoder)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
