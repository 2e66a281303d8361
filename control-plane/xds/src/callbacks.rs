use crate::{
    resources::{Resource, TypeUrl},
    Error,
};
use std::sync::Arc;

/// Identifies one discovery stream of a transport connection.
pub type StreamId = u64;

/// The node a discovery request describes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    /// The proxy identity, `{mesh}.{name}`.
    pub id: String,
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryRequest {
    /// Usually set only on the first request of a stream.
    pub node: Option<Node>,
    pub type_url: TypeUrl,
    pub version_info: String,
    pub resource_names: Vec<String>,

    /// The nonce of the response this request acknowledges. Empty on the initial request.
    pub response_nonce: String,

    /// Set when the proxy rejected the response.
    pub error_detail: Option<Status>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryResponse {
    pub type_url: TypeUrl,
    pub version_info: String,
    pub nonce: String,
    pub resources: Vec<Resource>,
}

/// Observes the lifecycle of discovery streams.
///
/// Errors returned when a stream opens or a request arrives are reported to the transport,
/// which closes the stream.
#[async_trait::async_trait]
pub trait StreamCallbacks: Send + Sync + 'static {
    async fn on_stream_open(
        &self,
        _stream: StreamId,
        _type_url: Option<TypeUrl>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_stream_request(
        &self,
        _stream: StreamId,
        _request: &DiscoveryRequest,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn on_stream_response(
        &self,
        _stream: StreamId,
        _request: &DiscoveryRequest,
        _response: &DiscoveryResponse,
    ) {
    }

    async fn on_stream_closed(&self, _stream: StreamId) {}
}

/// Dispatches stream events to an ordered list of callbacks.
///
/// Events are dispatched in order, except for closes, which are dispatched in reverse order.
/// The first error stops dispatch.
#[derive(Clone, Default)]
pub struct CallbacksChain(Vec<Arc<dyn StreamCallbacks>>);

// === impl DiscoveryRequest ===

impl DiscoveryRequest {
    /// Returns true if the request acknowledges or rejects a response.
    pub fn is_reply(&self) -> bool {
        !self.response_nonce.is_empty()
    }

    pub fn is_nack(&self) -> bool {
        self.is_reply() && self.error_detail.is_some()
    }
}

// === impl CallbacksChain ===

impl CallbacksChain {
    pub fn new(callbacks: impl IntoIterator<Item = Arc<dyn StreamCallbacks>>) -> Self {
        Self(callbacks.into_iter().collect())
    }
}

#[async_trait::async_trait]
impl StreamCallbacks for CallbacksChain {
    async fn on_stream_open(
        &self,
        stream: StreamId,
        type_url: Option<TypeUrl>,
    ) -> Result<(), Error> {
        for callbacks in &self.0 {
            callbacks.on_stream_open(stream, type_url).await?;
        }
        Ok(())
    }

    async fn on_stream_request(
        &self,
        stream: StreamId,
        request: &DiscoveryRequest,
    ) -> Result<(), Error> {
        for callbacks in &self.0 {
            callbacks.on_stream_request(stream, request).await?;
        }
        Ok(())
    }

    async fn on_stream_response(
        &self,
        stream: StreamId,
        request: &DiscoveryRequest,
        response: &DiscoveryResponse,
    ) {
        for callbacks in &self.0 {
            callbacks.on_stream_response(stream, request, response).await;
        }
    }

    async fn on_stream_closed(&self, stream: StreamId) {
        for callbacks in self.0.iter().rev() {
            callbacks.on_stream_closed(stream).await;
        }
    }
}

impl std::fmt::Debug for CallbacksChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CallbacksChain").field(&self.0.len()).finish()
    }
}
