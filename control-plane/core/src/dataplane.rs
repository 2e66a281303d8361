use crate::tags::{SelectorRank, TagSelector, Tags};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The address workloads listen on when an inbound does not name one.
pub const DEFAULT_WORKLOAD_ADDRESS: &str = "127.0.0.1";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataplane {
    pub networking: Networking,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Networking {
    /// An IP address or a DNS name.
    pub address: String,

    #[serde(default)]
    pub advertised_address: Option<String>,

    #[serde(default)]
    pub inbound: Vec<Inbound>,

    #[serde(default)]
    pub outbound: Vec<Outbound>,

    #[serde(default)]
    pub gateway: Option<Gateway>,

    #[serde(default)]
    pub transparent_proxying: Option<TransparentProxying>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub port: u16,

    #[serde(default)]
    pub service_port: Option<u16>,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub service_address: Option<String>,

    #[serde(default)]
    pub health: Option<Health>,

    #[serde(default)]
    pub tags: Tags,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub ready: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(default)]
    pub address: Option<String>,

    pub port: u16,

    #[serde(default)]
    pub tags: Tags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    #[serde(default)]
    pub tags: Tags,

    /// The port the gateway listens on. Gateways without a port only route outbound traffic.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransparentProxying {
    #[serde(default)]
    pub redirect_port_inbound: u16,

    #[serde(default)]
    pub redirect_port_outbound: u16,

    /// When non-empty, only these services are configured as outbounds.
    #[serde(default)]
    pub reachable_services: Vec<String>,
}

/// Identifies a single inbound listener of a dataplane.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InboundInterface {
    pub dataplane_address: String,
    pub dataplane_advertised_address: String,
    pub dataplane_port: u16,
    pub workload_address: String,
    pub workload_port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneIngress {
    #[serde(default)]
    pub zone: String,

    pub networking: ZoneProxyNetworking,

    #[serde(default)]
    pub available_services: Vec<AvailableService>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneEgress {
    #[serde(default)]
    pub zone: String,

    pub networking: ZoneProxyNetworking,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneProxyNetworking {
    pub address: String,

    #[serde(default)]
    pub advertised_address: Option<String>,

    pub port: u16,

    #[serde(default)]
    pub advertised_port: Option<u16>,
}

/// A service reachable through a zone ingress.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableService {
    pub mesh: String,

    pub tags: Tags,

    #[serde(default = "AvailableService::default_instances")]
    pub instances: u32,

    #[serde(default)]
    pub external_service: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalService {
    pub networking: ExternalServiceNetworking,

    #[serde(default)]
    pub tags: Tags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalServiceNetworking {
    /// A `host:port` pair.
    pub address: String,

    #[serde(default)]
    pub tls: Option<ExternalServiceTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalServiceTls {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub server_name: Option<String>,
}

// === impl Dataplane ===

impl Dataplane {
    pub fn is_gateway(&self) -> bool {
        self.networking.gateway.is_some()
    }

    /// Returns the tag sets that identify this dataplane as a traffic source: the tags of each
    /// inbound or, for gateways, the gateway tags.
    pub fn tag_sets(&self) -> impl Iterator<Item = &Tags> {
        let inbound = self.networking.inbound.iter().map(|i| &i.tags);
        let gateway = self.networking.gateway.iter().map(|g| &g.tags);
        inbound.chain(gateway)
    }

    pub fn matches(&self, selector: &TagSelector) -> bool {
        self.tag_sets().any(|tags| selector.matches(tags))
    }

    /// Returns the rank of the most specific selector that matches this dataplane.
    pub fn best_match_rank<'s>(
        &self,
        selectors: impl IntoIterator<Item = &'s TagSelector>,
    ) -> Option<SelectorRank> {
        selectors
            .into_iter()
            .filter(|s| self.matches(s))
            .map(TagSelector::rank)
            .max()
    }

    pub fn inbound_interface(&self, inbound: &Inbound) -> InboundInterface {
        let dataplane_address = inbound
            .address
            .clone()
            .unwrap_or_else(|| self.networking.address.clone());
        let dataplane_advertised_address = self
            .networking
            .advertised_address
            .clone()
            .unwrap_or_else(|| dataplane_address.clone());
        InboundInterface {
            dataplane_advertised_address,
            dataplane_address,
            dataplane_port: inbound.port,
            workload_address: inbound
                .service_address
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKLOAD_ADDRESS.to_string()),
            workload_port: inbound.service_port.unwrap_or(inbound.port),
        }
    }

    /// The address other dataplanes use to reach this one.
    pub fn advertised_address(&self) -> &str {
        self.networking
            .advertised_address
            .as_deref()
            .unwrap_or(&self.networking.address)
    }

    /// Returns true if the dataplane may configure an outbound for the given service.
    pub fn reaches(&self, service: &str) -> bool {
        match &self.networking.transparent_proxying {
            Some(tp) if !tp.reachable_services.is_empty() => {
                tp.reachable_services.iter().any(|s| s == service)
            }
            _ => true,
        }
    }

    pub fn zone(&self) -> Option<&str> {
        self.tag_sets().find_map(Tags::zone)
    }
}

// === impl Inbound ===

impl Inbound {
    /// Inbounds without health information are considered ready.
    pub fn is_ready(&self) -> bool {
        self.health.map(|h| h.ready).unwrap_or(true)
    }
}

impl fmt::Display for InboundInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.dataplane_address, self.dataplane_port, self.workload_port
        )
    }
}

// === impl ZoneProxyNetworking ===

impl ZoneProxyNetworking {
    pub fn advertised(&self) -> (&str, u16) {
        (
            self.advertised_address.as_deref().unwrap_or(&self.address),
            self.advertised_port.unwrap_or(self.port),
        )
    }
}

// === impl AvailableService ===

impl AvailableService {
    fn default_instances() -> u32 {
        1
    }
}

// === impl ExternalService ===

impl ExternalService {
    pub fn service(&self) -> Option<&str> {
        self.tags.service()
    }

    /// Splits the `host:port` address. Returns `None` if the port is missing or invalid.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.networking.address.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some((host, port.parse().ok()?))
    }

    pub fn tls_enabled(&self) -> bool {
        self.networking.tls.as_ref().is_some_and(|t| t.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_dataplane() -> Dataplane {
        Dataplane {
            networking: Networking {
                address: "10.0.0.1".to_string(),
                inbound: vec![
                    Inbound {
                        port: 8080,
                        service_port: Some(80),
                        tags: Tags::from([("service", "web"), ("version", "1")]),
                        ..Default::default()
                    },
                    Inbound {
                        port: 9090,
                        address: Some("10.0.0.2".to_string()),
                        health: Some(Health { ready: false }),
                        tags: Tags::from([("service", "admin")]),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        }
    }

    #[test]
    fn inbound_interfaces() {
        let dp = mk_dataplane();
        assert_eq!(
            dp.inbound_interface(&dp.networking.inbound[0]),
            InboundInterface {
                dataplane_address: "10.0.0.1".to_string(),
                dataplane_advertised_address: "10.0.0.1".to_string(),
                dataplane_port: 8080,
                workload_address: "127.0.0.1".to_string(),
                workload_port: 80,
            }
        );
        let second = dp.inbound_interface(&dp.networking.inbound[1]);
        assert_eq!(second.dataplane_address, "10.0.0.2");
        assert_eq!(second.workload_port, 9090);
        assert_eq!(second.to_string(), "10.0.0.2:9090:9090");
    }

    #[test]
    fn readiness_defaults_to_ready() {
        let dp = mk_dataplane();
        assert!(dp.networking.inbound[0].is_ready());
        assert!(!dp.networking.inbound[1].is_ready());
    }

    #[test]
    fn best_match_rank() {
        let dp = mk_dataplane();
        let any = TagSelector::from([("service", "*")]);
        let web_v1 = TagSelector::from([("service", "web"), ("version", "1")]);
        let backend = TagSelector::from([("service", "backend")]);

        assert_eq!(dp.best_match_rank([&any]), Some(any.rank()));
        assert_eq!(dp.best_match_rank([&any, &web_v1]), Some(web_v1.rank()));
        assert_eq!(dp.best_match_rank([&backend]), None);
        assert_eq!(dp.best_match_rank([]), None);
    }

    #[test]
    fn gateways_match_by_gateway_tags() {
        let dp = Dataplane {
            networking: Networking {
                address: "10.0.0.3".to_string(),
                gateway: Some(Gateway {
                    tags: Tags::from([("service", "edge")]),
                    port: None,
                }),
                ..Default::default()
            },
        };
        assert!(dp.is_gateway());
        assert!(dp.matches(&TagSelector::service("edge")));
        assert!(!dp.matches(&TagSelector::service("web")));
    }

    #[test]
    fn reachable_services() {
        let mut dp = mk_dataplane();
        assert!(dp.reaches("backend"));
        dp.networking.transparent_proxying = Some(TransparentProxying {
            reachable_services: vec!["redis".to_string()],
            ..Default::default()
        });
        assert!(dp.reaches("redis"));
        assert!(!dp.reaches("backend"));
    }

    #[test]
    fn external_service_address() {
        let mut es = ExternalService {
            networking: ExternalServiceNetworking {
                address: "httpbin.org:443".to_string(),
                tls: Some(ExternalServiceTls {
                    enabled: true,
                    server_name: None,
                }),
            },
            tags: Tags::from([("service", "httpbin")]),
        };
        assert_eq!(es.host_port(), Some(("httpbin.org", 443)));
        assert!(es.tls_enabled());

        es.networking.address = "httpbin.org".to_string();
        assert_eq!(es.host_port(), None);
        es.networking.address = ":80".to_string();
        assert_eq!(es.host_port(), None);
    }
}
