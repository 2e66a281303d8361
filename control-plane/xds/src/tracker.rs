use crate::{
    callbacks::{DiscoveryRequest, StreamCallbacks, StreamId},
    resources::TypeUrl,
    Error,
};
use ahash::AHashMap as HashMap;
use mesh_control_plane_core::{DataplaneMetadata, ProxyId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Starts the watchdog of a proxy. The watchdog must run until `shutdown` is signaled and
/// release it only once the proxy's configuration has been withdrawn.
pub trait NewWatchdog: Send + Sync + 'static {
    fn start(&self, id: ProxyId, metadata: DataplaneMetadata, shutdown: drain::Watch);
}

/// Runs exactly one watchdog for each proxy with at least one open stream.
///
/// The first request carrying a node identity associates a stream with its proxy. The
/// watchdog is started by the first associated stream and stopped when the last one closes.
pub struct SyncTracker {
    new_watchdog: Arc<dyn NewWatchdog>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    streams: HashMap<StreamId, Association>,
    proxies: HashMap<ProxyId, Watched>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Association {
    /// No request has carried an identity yet.
    Pending,

    /// The stream's identity could not be parsed.
    Unassociated,

    Proxy(ProxyId),
}

struct Watched {
    streams: usize,
    metadata: DataplaneMetadata,

    /// Unset while the watchdog is stopping.
    stop: Option<drain::Signal>,
}

// === impl SyncTracker ===

impl SyncTracker {
    pub fn new(new_watchdog: Arc<dyn NewWatchdog>) -> Self {
        Self {
            new_watchdog,
            state: Default::default(),
        }
    }

    /// Returns the number of proxies with a running watchdog.
    pub fn watched(&self) -> usize {
        self.state.lock().proxies.len()
    }

    fn start(&self, id: &ProxyId, metadata: DataplaneMetadata) -> drain::Signal {
        let (stop, shutdown) = drain::channel();
        info!(proxy = %id, proxy_type = %metadata.proxy_type, "Starting watchdog");
        self.new_watchdog.start(id.clone(), metadata, shutdown);
        stop
    }

    /// Stops a proxy's watchdog and waits for it to withdraw the proxy's configuration.
    ///
    /// Streams that associate with the proxy while it stops get a new watchdog once the old
    /// one has finished.
    async fn stop(&self, id: ProxyId, stop: drain::Signal) {
        debug!(proxy = %id, "Stopping watchdog");
        stop.drain().await;

        let mut state = self.state.lock();
        let Some(watched) = state.proxies.get_mut(&id) else {
            return;
        };
        if watched.streams == 0 {
            state.proxies.remove(&id);
            info!(proxy = %id, "Watchdog stopped");
            return;
        }
        let metadata = watched.metadata.clone();
        watched.stop = Some(self.start(&id, metadata));
    }
}

#[async_trait::async_trait]
impl StreamCallbacks for SyncTracker {
    async fn on_stream_open(&self, stream: StreamId, _: Option<TypeUrl>) -> Result<(), Error> {
        self.state.lock().streams.insert(stream, Association::Pending);
        Ok(())
    }

    async fn on_stream_request(
        &self,
        stream: StreamId,
        request: &DiscoveryRequest,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let association = state
            .streams
            .get_mut(&stream)
            .ok_or(Error::UnknownStream(stream))?;
        if *association != Association::Pending {
            return Ok(());
        }
        let Some(node) = &request.node else {
            return Ok(());
        };

        let id = match node.id.parse::<ProxyId>() {
            Ok(id) => id,
            Err(error) => {
                warn!(stream, %error, "Stream will not be associated with a proxy");
                *association = Association::Unassociated;
                return Ok(());
            }
        };
        *association = Association::Proxy(id.clone());

        let metadata = DataplaneMetadata::from_node_metadata(&node.metadata);
        if let Some(watched) = state.proxies.get_mut(&id) {
            watched.streams += 1;
            // A restarted watchdog describes the proxy as its latest stream reported it.
            watched.metadata = metadata;
            debug!(stream, proxy = %id, streams = watched.streams, "Stream associated");
            return Ok(());
        }
        let stop = self.start(&id, metadata.clone());
        debug!(stream, proxy = %id, streams = 1, "Stream associated");
        state.proxies.insert(
            id,
            Watched {
                streams: 1,
                metadata,
                stop: Some(stop),
            },
        );
        Ok(())
    }

    async fn on_stream_closed(&self, stream: StreamId) {
        let stopping = {
            let mut state = self.state.lock();
            let Some(Association::Proxy(id)) = state.streams.remove(&stream) else {
                return;
            };
            let Some(watched) = state.proxies.get_mut(&id) else {
                return;
            };
            watched.streams = watched.streams.saturating_sub(1);
            debug!(stream, proxy = %id, streams = watched.streams, "Stream closed");
            if watched.streams > 0 {
                return;
            }
            // Another stream is already stopping this watchdog.
            let Some(stop) = watched.stop.take() else {
                return;
            };
            (id, stop)
        };

        let (id, stop) = stopping;
        self.stop(id, stop).await;
    }
}

impl std::fmt::Debug for SyncTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncTracker")
            .field("streams", &state.streams.len())
            .field("proxies", &state.proxies.len())
            .finish_non_exhaustive()
    }
}
