use crate::{resource::ResourceType, tags::TagSelector};
use serde::{Deserialize, Serialize};

/// A policy connects traffic sources to destinations and configures that traffic.
///
/// A policy without sources is malformed and never matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub sources: Vec<TagSelector>,

    /// Empty for dataplane-scoped policies such as proxy templates.
    pub destinations: Vec<TagSelector>,

    pub conf: PolicyConf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PolicyConf {
    TrafficPermission(TrafficPermissionConf),
    TrafficRoute(TrafficRouteConf),
    TrafficLog(TrafficLogConf),
    FaultInjection(FaultInjectionConf),
    RateLimit(RateLimitConf),
    Timeout(TimeoutConf),
    HealthCheck(HealthCheckConf),
    CircuitBreaker(CircuitBreakerConf),
    Retry(RetryConf),
    ProxyTemplate(ProxyTemplateConf),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficPermissionConf {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRouteConf {
    #[serde(default)]
    pub split: Vec<Split>,

    #[serde(default)]
    pub load_balancer: Option<LoadBalancer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    #[serde(default = "Split::default_weight")]
    pub weight: u32,

    pub destination: TagSelector,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancer {
    #[default]
    RoundRobin,
    LeastRequest,
    RingHash,
    Random,
    Maglev,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficLogConf {
    /// The logging backend; the mesh default when unset.
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultInjectionConf {
    #[serde(default)]
    pub delay: Option<FaultDelay>,

    #[serde(default)]
    pub abort: Option<FaultAbort>,

    #[serde(default)]
    pub response_bandwidth: Option<FaultBandwidth>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultDelay {
    pub percentage: f64,
    pub value_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultAbort {
    pub percentage: f64,
    pub http_status: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultBandwidth {
    pub percentage: f64,
    pub limit_kbps: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConf {
    pub requests: u32,
    pub interval_ms: u64,

    /// The status returned to limited requests.
    #[serde(default)]
    pub on_rate_limit_status: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConf {
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub tcp_idle_timeout_ms: Option<u64>,

    #[serde(default)]
    pub http_request_timeout_ms: Option<u64>,

    #[serde(default)]
    pub http_idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConf {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,

    #[serde(default)]
    pub http_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConf {
    #[serde(default)]
    pub max_connections: Option<u32>,

    #[serde(default)]
    pub max_pending_requests: Option<u32>,

    #[serde(default)]
    pub max_requests: Option<u32>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Ejects an endpoint after this many consecutive errors.
    #[serde(default)]
    pub consecutive_errors: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConf {
    pub num_retries: u32,

    #[serde(default)]
    pub per_try_timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry_on: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTemplateConf {
    /// Generator profiles to apply instead of the default profile.
    #[serde(default)]
    pub imports: Vec<String>,
}

// === impl Policy ===

impl Policy {
    pub fn is_valid(&self) -> bool {
        !self.sources.is_empty()
    }
}

// === impl PolicyConf ===

impl PolicyConf {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::TrafficPermission(_) => ResourceType::TrafficPermission,
            Self::TrafficRoute(_) => ResourceType::TrafficRoute,
            Self::TrafficLog(_) => ResourceType::TrafficLog,
            Self::FaultInjection(_) => ResourceType::FaultInjection,
            Self::RateLimit(_) => ResourceType::RateLimit,
            Self::Timeout(_) => ResourceType::Timeout,
            Self::HealthCheck(_) => ResourceType::HealthCheck,
            Self::CircuitBreaker(_) => ResourceType::CircuitBreaker,
            Self::Retry(_) => ResourceType::Retry,
            Self::ProxyTemplate(_) => ResourceType::ProxyTemplate,
        }
    }

    /// Decodes the configuration of a policy of the given type. A null configuration decodes
    /// as an empty object.
    pub fn from_json(rtype: ResourceType, conf: serde_json::Value) -> serde_json::Result<Self> {
        use serde::de::Error;
        use serde_json::from_value;

        let conf = match conf {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            conf => conf,
        };
        let conf = match rtype {
            ResourceType::TrafficPermission => Self::TrafficPermission(from_value(conf)?),
            ResourceType::TrafficRoute => Self::TrafficRoute(from_value(conf)?),
            ResourceType::TrafficLog => Self::TrafficLog(from_value(conf)?),
            ResourceType::FaultInjection => Self::FaultInjection(from_value(conf)?),
            ResourceType::RateLimit => Self::RateLimit(from_value(conf)?),
            ResourceType::Timeout => Self::Timeout(from_value(conf)?),
            ResourceType::HealthCheck => Self::HealthCheck(from_value(conf)?),
            ResourceType::CircuitBreaker => Self::CircuitBreaker(from_value(conf)?),
            ResourceType::Retry => Self::Retry(from_value(conf)?),
            ResourceType::ProxyTemplate => Self::ProxyTemplate(from_value(conf)?),
            rtype => {
                return Err(serde_json::Error::custom(format!(
                    "{rtype} is not a policy type"
                )))
            }
        };
        Ok(conf)
    }
}

// === impl Split ===

impl Split {
    fn default_weight() -> u32 {
        1
    }
}
