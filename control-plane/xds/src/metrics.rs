use crate::resources::TypeUrl;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Discovery stream metrics.
#[derive(Clone, Debug, Default)]
pub struct XdsMetrics {
    streams: Gauge,
    requests: Family<RequestLabels, Counter>,
    responses: Family<TypeLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    type_url: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    type_url: &'static str,
}

// === impl XdsMetrics ===

impl XdsMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "streams",
            "Number of open discovery streams",
            metrics.streams.clone(),
        );
        reg.register(
            "requests",
            "Total number of discovery requests, by whether they acknowledged a response",
            metrics.requests.clone(),
        );
        reg.register(
            "responses",
            "Total number of discovery responses sent",
            metrics.responses.clone(),
        );
        metrics
    }

    pub(crate) fn stream_opened(&self) {
        self.streams.inc();
    }

    pub(crate) fn stream_closed(&self) {
        self.streams.dec();
    }

    pub(crate) fn request(&self, type_url: TypeUrl, result: &'static str) {
        self.requests
            .get_or_create(&RequestLabels {
                type_url: type_url.short_name(),
                result,
            })
            .inc();
    }

    pub(crate) fn response(&self, type_url: TypeUrl) {
        self.responses
            .get_or_create(&TypeLabels {
                type_url: type_url.short_name(),
            })
            .inc();
    }

    pub fn open_streams(&self) -> i64 {
        self.streams.get()
    }
}
