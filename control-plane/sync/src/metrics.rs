use mesh_control_plane_core::ProxyType;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct WatchdogMetrics {
    durations: Family<ResultLabels, Histogram>,
    errors: Family<TypeLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    proxy_type: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    proxy_type: &'static str,
}

// === impl WatchdogMetrics ===

impl WatchdogMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let durations = Family::<ResultLabels, Histogram>::new_with_constructor(|| {
            // 1ms to ~16s.
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        reg.register_with_unit(
            "reconciliation",
            "Histogram of the time spent reconciling a proxy's configuration",
            Unit::Seconds,
            durations.clone(),
        );

        let errors = Family::<TypeLabels, Counter>::default();
        reg.register(
            "reconciliation_errors",
            "Total number of failed reconciliations",
            errors.clone(),
        );

        Self { durations, errors }
    }

    pub(crate) fn observe(
        &self,
        proxy_type: ProxyType,
        result: &'static str,
        elapsed: time::Duration,
    ) {
        self.durations
            .get_or_create(&ResultLabels {
                proxy_type: proxy_type.as_str(),
                result,
            })
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn error(&self, proxy_type: ProxyType) {
        self.errors
            .get_or_create(&TypeLabels {
                proxy_type: proxy_type.as_str(),
            })
            .inc();
    }

    pub fn errors(&self, proxy_type: ProxyType) -> u64 {
        self.errors
            .get_or_create(&TypeLabels {
                proxy_type: proxy_type.as_str(),
            })
            .get()
    }
}
