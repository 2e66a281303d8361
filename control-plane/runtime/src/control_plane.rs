use mesh_control_plane_core::{
    Clock, DataplaneMetadata, IdGenerator, ProxyId, ResourceStore, SystemClock, UuidGenerator,
};
use mesh_control_plane_sync::{
    mesh_cache, DataplaneWatchdog, Dependencies, MeshCache, ProxyBuilder, Resolve,
    WatchdogMetrics,
};
use mesh_control_plane_xds::{
    callbacks::Node, resources::TypeUrl, CallbacksChain, DiscoveryRequest, MemorySnapshotCache,
    NewWatchdog, ProfileGenerator, Reconciler, Secrets, StatusTracker, StreamCallbacks, StreamId,
    SyncTracker, Versioner, XdsMetrics,
};
use prometheus_client::registry::Registry;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::time;
use tracing::{info_span, Instrument};

#[derive(Clone, Debug)]
pub struct Config {
    /// The zone this control plane runs in.
    pub zone: String,
    pub sync_interval: time::Duration,
    pub mesh_cache_expiration: time::Duration,
}

/// The assembled reconciliation pipeline, driven by stream events.
pub struct ControlPlane {
    callbacks: CallbacksChain,
    snapshots: Arc<MemorySnapshotCache>,
    status: Arc<StatusTracker>,
    tracker: Arc<SyncTracker>,
    mesh_cache: MeshCache,
    next_stream: AtomicU64,
}

/// Spawns a [`DataplaneWatchdog`] task for each proxy.
#[derive(Clone)]
pub struct WatchdogFactory {
    deps: Dependencies,
    interval: time::Duration,
}

// === impl ControlPlane ===

impl ControlPlane {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        resolver: Arc<dyn Resolve>,
        config: Config,
        prom: &mut Registry,
    ) -> Self {
        let Config {
            zone,
            sync_interval,
            mesh_cache_expiration,
        } = config;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);

        let mesh_cache = MeshCache::new(store, resolver, zone.clone(), mesh_cache_expiration);
        mesh_cache::register(prom.sub_registry_with_prefix("mesh_cache"), &mesh_cache);
        let watchdog_metrics = WatchdogMetrics::register(prom.sub_registry_with_prefix("watchdog"));
        let xds_metrics = XdsMetrics::register(prom.sub_registry_with_prefix("xds"));

        let secrets = Arc::new(Secrets::new(clock.clone()));
        let snapshots = Arc::new(MemorySnapshotCache::default());
        let reconciler = Reconciler::new(
            Arc::new(ProfileGenerator::new(secrets.clone())),
            Versioner::new(ids.clone()),
            secrets,
            snapshots.clone(),
        );
        let deps = Dependencies {
            cache: mesh_cache.clone(),
            builder: Arc::new(ProxyBuilder::new(zone)),
            reconciler: Arc::new(reconciler),
            metrics: watchdog_metrics,
        };

        let tracker = Arc::new(SyncTracker::new(Arc::new(WatchdogFactory {
            deps,
            interval: sync_interval,
        })));
        let status = Arc::new(StatusTracker::new(clock, ids, xds_metrics));
        let callbacks = CallbacksChain::new([
            status.clone() as Arc<dyn StreamCallbacks>,
            tracker.clone() as Arc<dyn StreamCallbacks>,
        ]);

        Self {
            callbacks,
            snapshots,
            status,
            tracker,
            mesh_cache,
            next_stream: AtomicU64::new(1),
        }
    }

    /// The entry point for stream events from the transport.
    pub fn callbacks(&self) -> &CallbacksChain {
        &self.callbacks
    }

    pub fn snapshots(&self) -> &MemorySnapshotCache {
        &self.snapshots
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    pub fn mesh_cache(&self) -> &MeshCache {
        &self.mesh_cache
    }

    /// Opens a stream on behalf of a proxy and sends its initial request, as a transport
    /// would when the proxy connects.
    pub async fn connect(
        &self,
        node_id: &str,
        metadata: &DataplaneMetadata,
    ) -> anyhow::Result<StreamId> {
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.callbacks.on_stream_open(stream, None).await?;
        let request = DiscoveryRequest {
            node: Some(Node {
                id: node_id.to_string(),
                metadata: serde_json::to_value(metadata)?,
            }),
            type_url: TypeUrl::Cluster,
            version_info: String::new(),
            resource_names: vec![],
            response_nonce: String::new(),
            error_detail: None,
        };
        if let Err(error) = self.callbacks.on_stream_request(stream, &request).await {
            self.callbacks.on_stream_closed(stream).await;
            return Err(error.into());
        }
        Ok(stream)
    }

    /// Closes a stream. Returns once the proxy's watchdog, if this was its last stream, has
    /// withdrawn the proxy's configuration.
    pub async fn disconnect(&self, stream: StreamId) {
        self.callbacks.on_stream_closed(stream).await;
    }

    /// Returns the proxy a stream serves, if its identity was valid.
    pub fn stream_proxy(&self, stream: StreamId) -> Option<ProxyId> {
        self.status.status(stream)?.proxy_id
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("callbacks", &self.callbacks)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

// === impl WatchdogFactory ===

impl NewWatchdog for WatchdogFactory {
    fn start(&self, id: ProxyId, metadata: DataplaneMetadata, shutdown: drain::Watch) {
        let span = info_span!("watchdog", proxy = %id);
        let watchdog = DataplaneWatchdog::new(id, metadata, self.deps.clone());
        tokio::spawn(watchdog.run(self.interval, shutdown).instrument(span));
    }
}
