use super::*;
use crate::tests::{any_service, mk_dataplane, mk_policy, TestConfig, ZONE};
use mesh_control_plane_core::{
    dataplane::{
        ExternalService, ExternalServiceNetworking, Gateway, ZoneEgress, ZoneIngress,
        ZoneProxyNetworking,
    },
    mesh::{CaBackend, LogSink, Logging, LoggingBackend, MeshRouting, MeshSpec, Mtls},
    policy::{
        FaultDelay, FaultInjectionConf, TimeoutConf, TrafficLogConf, TrafficPermissionConf,
        TrafficRouteConf,
    },
    TagSelector,
};

fn names(policies: &[PolicyRef]) -> Vec<&str> {
    policies.iter().map(|p| p.name()).collect()
}

fn mtls_mesh() -> MeshSpec {
    MeshSpec {
        mtls: Some(Mtls {
            enabled_backend: Some("ca-1".to_string()),
            backends: vec![CaBackend {
                name: "ca-1".to_string(),
                kind: "builtin".to_string(),
                cert_validity_secs: 3600,
            }],
        }),
        routing: MeshRouting {
            zone_egress: true,
            locality_aware_load_balancing: false,
        },
        ..Default::default()
    }
}

fn fault_injection() -> PolicyConf {
    PolicyConf::FaultInjection(FaultInjectionConf {
        delay: Some(FaultDelay {
            percentage: 50.0,
            value_ms: 100,
        }),
        ..Default::default()
    })
}

fn web_tags() -> Tags {
    Tags::from([("service", "web")])
}

async fn mesh_ctx(test: &TestConfig, mesh: &str) -> MeshContext {
    MeshContext::Mesh(test.cache.snapshot(mesh).await.expect("mesh must build"))
}

#[tokio::test(start_paused = true)]
async fn fault_injection_follows_the_store() {
    let test = TestConfig::default();
    let store = test.store.store();
    store.create("", "default", MeshSpec::default()).unwrap();
    store
        .create("default", "web-1", mk_dataplane("10.0.0.1", [(8080, web_tags())], []))
        .unwrap();
    store
        .create(
            "default",
            "fi-1",
            mk_policy([any_service()], [TagSelector::service("web")], fault_injection()),
        )
        .unwrap();

    let builder = ProxyBuilder::new(ZONE);
    let id = ProxyId::new("default", "web-1");
    let proxy = builder
        .build(&id, &Default::default(), &mesh_ctx(&test, "default").await)
        .expect("proxy must build");
    assert_eq!(proxy.proxy_type(), ProxyType::Sidecar);
    let dp = proxy.as_dataplane().expect("must be a dataplane");
    let iface = dp
        .dataplane
        .spec
        .inbound_interface(&dp.dataplane.spec.networking.inbound[0]);
    assert_eq!(dp.policies.fault_injections.len(), 1);
    assert_eq!(names(&dp.policies.fault_injections[&iface]), vec!["fi-1"]);

    store
        .delete(
            ResourceType::FaultInjection,
            &ResourceKey::new("default", "fi-1"),
        )
        .unwrap();
    test.cache.invalidate("default");

    let proxy = builder
        .build(&id, &Default::default(), &mesh_ctx(&test, "default").await)
        .expect("proxy must build");
    let dp = proxy.as_dataplane().expect("must be a dataplane");
    assert!(dp.policies.fault_injections.is_empty());
}

#[tokio::test(start_paused = true)]
async fn resolves_outbound_policies() {
    let test = TestConfig::default();
    let store = test.store.store();
    store
        .create(
            "",
            "default",
            MeshSpec {
                logging: Some(Logging {
                    default_backend: Some("file".to_string()),
                    backends: vec![LoggingBackend {
                        name: "file".to_string(),
                        format: None,
                        sink: LogSink::File {
                            path: "/dev/stdout".to_string(),
                        },
                    }],
                }),
                ..Default::default()
            },
        )
        .unwrap();
    store
        .create(
            "default",
            "web-1",
            mk_dataplane("10.0.0.1", [(8080, web_tags())], ["backend"]),
        )
        .unwrap();
    store
        .create(
            "default",
            "backend-1",
            mk_dataplane(
                "10.0.0.2",
                [(8080, Tags::from([("service", "backend"), ("version", "1")]))],
                [],
            ),
        )
        .unwrap();
    store
        .create(
            "default",
            "route-all",
            mk_policy(
                [any_service()],
                [any_service()],
                PolicyConf::TrafficRoute(TrafficRouteConf::default()),
            ),
        )
        .unwrap();
    store
        .create(
            "default",
            "timeout-all",
            mk_policy(
                [any_service()],
                [any_service()],
                PolicyConf::Timeout(TimeoutConf {
                    connect_timeout_ms: 1000,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    store
        .create(
            "default",
            "timeout-web-backend",
            mk_policy(
                [TagSelector::service("web")],
                [TagSelector::service("backend")],
                PolicyConf::Timeout(TimeoutConf {
                    connect_timeout_ms: 50,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    store
        .create(
            "default",
            "logs",
            mk_policy(
                [any_service()],
                [any_service()],
                PolicyConf::TrafficLog(TrafficLogConf::default()),
            ),
        )
        .unwrap();

    let proxy = ProxyBuilder::new(ZONE)
        .build(
            &ProxyId::new("default", "web-1"),
            &Default::default(),
            &mesh_ctx(&test, "default").await,
        )
        .expect("proxy must build");
    let dp = proxy.as_dataplane().expect("must be a dataplane");

    assert_eq!(dp.routing.traffic_routes["backend"].name(), "route-all");
    assert_eq!(
        dp.destinations,
        maplit::btreemap! {
            "backend".to_string() => vec![TagSelector::service("backend")],
        }
    );
    let targets = &dp.routing.outbound_targets["backend"];
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].target, "10.0.0.2");
    assert_eq!(targets[0].port, 8080);

    assert_eq!(dp.policies.timeouts["backend"].name(), "timeout-web-backend");
    assert_eq!(dp.policies.traffic_logs["backend"].name, "file");
    assert_eq!(dp.policies.traffic_routes, dp.routing.traffic_routes);
    assert!(dp.policies.health_checks.is_empty());
    assert!(dp.policies.proxy_template.is_none());
}

#[tokio::test(start_paused = true)]
async fn gateways_have_no_inbound_policies() {
    let test = TestConfig::default();
    let store = test.store.store();
    store.create("", "default", MeshSpec::default()).unwrap();
    let mut gateway = mk_dataplane("10.0.0.3", [], ["backend"]);
    gateway.networking.gateway = Some(Gateway {
        tags: Tags::from([("service", "edge")]),
        port: Some(8443),
    });
    store.create("default", "edge-1", gateway).unwrap();
    store
        .create(
            "default",
            "allow-all",
            mk_policy(
                [any_service()],
                [any_service()],
                PolicyConf::TrafficPermission(TrafficPermissionConf {}),
            ),
        )
        .unwrap();
    store
        .create(
            "default",
            "timeout-all",
            mk_policy(
                [any_service()],
                [any_service()],
                PolicyConf::Timeout(TimeoutConf::default()),
            ),
        )
        .unwrap();

    let metadata = DataplaneMetadata {
        proxy_type: ProxyType::Gateway,
        ..Default::default()
    };
    let proxy = ProxyBuilder::new(ZONE)
        .build(
            &ProxyId::new("default", "edge-1"),
            &metadata,
            &mesh_ctx(&test, "default").await,
        )
        .expect("proxy must build");
    assert_eq!(proxy.proxy_type(), ProxyType::Gateway);
    let dp = proxy.as_dataplane().expect("must be a dataplane");
    assert!(dp.policies.traffic_permissions.is_empty());
    assert_eq!(dp.policies.timeouts["backend"].name(), "timeout-all");
}

#[tokio::test(start_paused = true)]
async fn missing_dataplane_is_not_found() {
    let test = TestConfig::default();
    test.store
        .store()
        .create("", "default", MeshSpec::default())
        .unwrap();
    let error = ProxyBuilder::new(ZONE)
        .build(
            &ProxyId::new("default", "web-1"),
            &Default::default(),
            &mesh_ctx(&test, "default").await,
        )
        .expect_err("dataplane must be missing");
    assert!(error.is_not_found(), "{error}");
}

#[tokio::test(start_paused = true)]
async fn zone_proxies_require_global_context() {
    let test = TestConfig::default();
    test.store
        .store()
        .create("", "default", MeshSpec::default())
        .unwrap();
    let metadata = DataplaneMetadata {
        proxy_type: ProxyType::Ingress,
        ..Default::default()
    };
    let error = ProxyBuilder::new(ZONE)
        .build(
            &ProxyId::new("", "ingress-1"),
            &metadata,
            &mesh_ctx(&test, "default").await,
        )
        .expect_err("ingress must not build from a mesh");
    assert!(
        matches!(error, Error::UnexpectedContext(ProxyType::Ingress)),
        "{error}"
    );
}

#[tokio::test(start_paused = true)]
async fn builds_zone_ingress() {
    let test = TestConfig::default();
    let store = test.store.store();
    store.create("", "default", mtls_mesh()).unwrap();
    store.create("", "plaintext", MeshSpec::default()).unwrap();
    store
        .create("default", "web-1", mk_dataplane("10.0.0.1", [(8080, web_tags())], []))
        .unwrap();
    store
        .create("plaintext", "web-1", mk_dataplane("10.0.1.1", [(8080, web_tags())], []))
        .unwrap();
    store
        .create(
            "",
            "ingress-1",
            ZoneIngress {
                zone: ZONE.to_string(),
                networking: ZoneProxyNetworking {
                    address: "10.1.0.1".to_string(),
                    port: 10001,
                    ..Default::default()
                },
                available_services: vec![],
            },
        )
        .unwrap();

    let metadata = DataplaneMetadata {
        proxy_type: ProxyType::Ingress,
        ..Default::default()
    };
    let ctx = MeshContext::Global(test.cache.global().await.unwrap());
    let proxy = ProxyBuilder::new(ZONE)
        .build(&ProxyId::new("", "ingress-1"), &metadata, &ctx)
        .expect("ingress must build");
    let ProxyKind::Ingress(ingress) = &proxy.kind else {
        panic!("expected an ingress proxy");
    };
    assert_eq!(ingress.meshes.len(), 1);
    assert_eq!(ingress.meshes[0].mesh.meta.name, "default");
    assert_eq!(ingress.meshes[0].endpoints["web"][0].target, "10.0.0.1");
}

#[tokio::test(start_paused = true)]
async fn builds_zone_egress() {
    let test = TestConfig::default();
    let store = test.store.store();
    store.create("", "default", mtls_mesh()).unwrap();
    store
        .create(
            "default",
            "httpbin",
            ExternalService {
                networking: ExternalServiceNetworking {
                    address: "httpbin.org:443".to_string(),
                    tls: None,
                },
                tags: Tags::from([("service", "httpbin")]),
            },
        )
        .unwrap();
    store
        .create(
            "default",
            "allow-httpbin",
            mk_policy(
                [any_service()],
                [TagSelector::service("httpbin")],
                PolicyConf::TrafficPermission(TrafficPermissionConf {}),
            ),
        )
        .unwrap();
    store
        .create(
            "",
            "egress-1",
            ZoneEgress {
                zone: ZONE.to_string(),
                networking: ZoneProxyNetworking {
                    address: "10.2.0.1".to_string(),
                    port: 10002,
                    ..Default::default()
                },
            },
        )
        .unwrap();

    let metadata = DataplaneMetadata {
        proxy_type: ProxyType::Egress,
        ..Default::default()
    };
    let ctx = MeshContext::Global(test.cache.global().await.unwrap());
    let proxy = ProxyBuilder::new(ZONE)
        .build(&ProxyId::new("", "egress-1"), &metadata, &ctx)
        .expect("egress must build");
    let ProxyKind::Egress(egress) = &proxy.kind else {
        panic!("expected an egress proxy");
    };
    assert_eq!(egress.meshes.len(), 1);
    let mesh = &egress.meshes[0];
    assert_eq!(mesh.external_services.len(), 1);
    assert_eq!(
        names(&mesh.traffic_permissions["httpbin"]),
        vec!["allow-httpbin"]
    );
    assert!(mesh.fault_injections.is_empty());
}
