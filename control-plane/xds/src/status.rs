use crate::{
    callbacks::{DiscoveryRequest, DiscoveryResponse, StreamCallbacks, StreamId},
    metrics::XdsMetrics,
    resources::TypeUrl,
    Error,
};
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use mesh_control_plane_core::{Clock, DataplaneMetadata, IdGenerator, ProxyId};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Tracks the state of every open discovery stream: which proxy it serves and how the proxy
/// has answered the responses sent to it.
pub struct StatusTracker {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    metrics: XdsMetrics,
    streams: Mutex<HashMap<StreamId, StreamStatus>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamStatus {
    pub subscription_id: String,
    pub proxy_id: Option<ProxyId>,
    pub metadata: Option<DataplaneMetadata>,
    pub connected_at: DateTime<Utc>,

    /// When the proxy last acknowledged or rejected a response.
    pub last_update: Option<DateTime<Utc>>,

    pub total: ResponseStats,
    pub by_type: BTreeMap<TypeUrl, ResponseStats>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseStats {
    pub sent: u64,
    pub acks: u64,
    pub nacks: u64,
}

// === impl StatusTracker ===

impl StatusTracker {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, metrics: XdsMetrics) -> Self {
        Self {
            clock,
            ids,
            metrics,
            streams: Default::default(),
        }
    }

    pub fn status(&self, stream: StreamId) -> Option<StreamStatus> {
        self.streams.lock().get(&stream).cloned()
    }

    /// Returns the statuses of all streams serving the given proxy.
    pub fn proxy_statuses(&self, id: &ProxyId) -> Vec<StreamStatus> {
        let mut statuses = self
            .streams
            .lock()
            .values()
            .filter(|status| status.proxy_id.as_ref() == Some(id))
            .cloned()
            .collect::<Vec<_>>();
        statuses.sort_by_key(|status| status.connected_at);
        statuses
    }
}

#[async_trait::async_trait]
impl StreamCallbacks for StatusTracker {
    async fn on_stream_open(&self, stream: StreamId, _: Option<TypeUrl>) -> Result<(), Error> {
        let status = StreamStatus {
            subscription_id: self.ids.next_id(),
            proxy_id: None,
            metadata: None,
            connected_at: self.clock.now(),
            last_update: None,
            total: ResponseStats::default(),
            by_type: BTreeMap::new(),
        };
        debug!(stream, subscription = %status.subscription_id, "Stream opened");
        self.streams.lock().insert(stream, status);
        self.metrics.stream_opened();
        Ok(())
    }

    async fn on_stream_request(
        &self,
        stream: StreamId,
        request: &DiscoveryRequest,
    ) -> Result<(), Error> {
        let mut streams = self.streams.lock();
        let status = streams
            .get_mut(&stream)
            .ok_or(Error::UnknownStream(stream))?;

        if status.proxy_id.is_none() {
            if let Some(node) = &request.node {
                if let Ok(id) = node.id.parse::<ProxyId>() {
                    status.proxy_id = Some(id);
                    status.metadata = Some(DataplaneMetadata::from_node_metadata(&node.metadata));
                }
            }
        }

        if !request.is_reply() {
            self.metrics.request(request.type_url, "initial");
            return Ok(());
        }

        status.last_update = Some(self.clock.now());
        let by_type = status.by_type.entry(request.type_url).or_default();
        match &request.error_detail {
            Some(error) => {
                status.total.nacks += 1;
                by_type.nacks += 1;
                self.metrics.request(request.type_url, "nack");
                warn!(
                    stream,
                    proxy = ?status.proxy_id,
                    type_url = %request.type_url.short_name(),
                    nonce = %request.response_nonce,
                    code = error.code,
                    error = %error.message,
                    "Proxy rejected configuration",
                );
            }
            None => {
                status.total.acks += 1;
                by_type.acks += 1;
                self.metrics.request(request.type_url, "ack");
            }
        }
        Ok(())
    }

    async fn on_stream_response(
        &self,
        stream: StreamId,
        _: &DiscoveryRequest,
        response: &DiscoveryResponse,
    ) {
        let mut streams = self.streams.lock();
        let Some(status) = streams.get_mut(&stream) else {
            return;
        };
        status.total.sent += 1;
        status.by_type.entry(response.type_url).or_default().sent += 1;
        self.metrics.response(response.type_url);
    }

    async fn on_stream_closed(&self, stream: StreamId) {
        if let Some(status) = self.streams.lock().remove(&stream) {
            debug!(stream, proxy = ?status.proxy_id, "Stream closed");
            self.metrics.stream_closed();
        }
    }
}

impl std::fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTracker")
            .field("streams", &self.streams.lock().len())
            .finish_non_exhaustive()
    }
}
