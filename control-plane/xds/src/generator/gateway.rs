use super::{
    outbound::{splits, virtual_host},
    ResourceGenerator,
};
use crate::{
    resources::{Direction, Filter, FilterChain, Listener, ResourceSet, RouteConfiguration},
    Error,
};
use mesh_control_plane_core::Proxy;

/// Generates the listener of a gateway, routing by host name to the gateway's outbound
/// services. The clusters themselves come from the outbound generator.
#[derive(Copy, Clone, Debug, Default)]
pub struct GatewayGenerator;

impl ResourceGenerator for GatewayGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        let Some(dp) = proxy.as_dataplane() else {
            return Ok(resources);
        };
        let spec = &dp.dataplane.spec;
        let Some(port) = spec.networking.gateway.as_ref().and_then(|g| g.port) else {
            return Ok(resources);
        };

        let virtual_hosts = spec
            .networking
            .outbound
            .iter()
            .filter_map(|outbound| {
                let service = outbound.tags.service()?;
                if !spec.reaches(service) {
                    return None;
                }
                let splits = splits(dp, service, &outbound.tags);
                Some(virtual_host(dp, service, &splits, vec![service.to_string()]))
            })
            .collect();
        let route_config = format!("gateway:{}", proxy.id.name);
        resources.add(RouteConfiguration {
            name: route_config.clone(),
            virtual_hosts,
        });

        let address = &spec.networking.address;
        resources.add(Listener {
            name: format!("gateway:{address}:{port}"),
            address: address.clone(),
            port,
            direction: Direction::Inbound,
            filter_chains: vec![FilterChain {
                name: proxy.id.name.clone(),
                server_names: vec![],
                tls: None,
                filters: vec![Filter::HttpConnectionManager {
                    stat_prefix: proxy.id.name.clone(),
                    route_config,
                    access_log: None,
                    idle_timeout_ms: None,
                }],
            }],
        });

        Ok(resources)
    }
}
