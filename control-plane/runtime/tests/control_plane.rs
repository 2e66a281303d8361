use mesh_control_plane_runtime::{
    core::{DataplaneMetadata, MemoryStore, ProxyId, ResourceKey, ResourceType, SystemClock},
    resources,
    sync::Resolve,
    xds::{
        resources::{Filter, Resource, TypeUrl},
        Snapshot, SnapshotCache,
    },
    Config, ControlPlane,
};
use prometheus_client::registry::Registry;
use std::{net::IpAddr, sync::Arc};
use tokio::time;
use tokio_stream::{wrappers::WatchStream, StreamExt};

const RESOURCES: &str = r#"[
    {"type": "Mesh", "name": "default", "spec": {}},
    {
        "type": "Dataplane",
        "mesh": "default",
        "name": "web-1",
        "spec": {
            "networking": {
                "address": "10.0.0.1",
                "inbound": [{"port": 8080, "service_port": 80, "tags": {"service": "web"}}],
                "outbound": [{"port": 10001, "tags": {"service": "backend"}}]
            }
        }
    },
    {
        "type": "Dataplane",
        "mesh": "default",
        "name": "backend-1",
        "spec": {
            "networking": {
                "address": "10.0.1.1",
                "inbound": [{"port": 8080, "tags": {"service": "backend"}}]
            }
        }
    },
    {
        "type": "FaultInjection",
        "mesh": "default",
        "name": "web-faults",
        "spec": {
            "sources": [{"service": "*"}],
            "destinations": [{"service": "web"}],
            "conf": {"abort": {"percentage": 50.0, "http_status": 503}}
        }
    }
]"#;

/// Resolves nothing; every address in these tests is an IP.
struct NoDns;

#[async_trait::async_trait]
impl Resolve for NoDns {
    async fn resolve(&self, host: &str) -> std::io::Result<IpAddr> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("unexpected lookup of {host}"),
        ))
    }
}

fn mk_control_plane(store: Arc<MemoryStore>, prom: &mut Registry) -> ControlPlane {
    ControlPlane::new(
        store,
        Arc::new(NoDns),
        Config {
            zone: "zone-1".to_string(),
            sync_interval: time::Duration::from_millis(100),
            mesh_cache_expiration: time::Duration::from_secs(60),
        },
        prom,
    )
}

fn has_fault(snapshot: &Snapshot) -> bool {
    match snapshot.get(TypeUrl::Listener, "inbound:10.0.0.1:8080") {
        Some(Resource::Listener(listener)) => listener.filter_chains[0]
            .filters
            .iter()
            .any(|f| matches!(f, Filter::Fault { .. })),
        other => panic!("unexpected inbound listener: {other:?}"),
    }
}

/// Waits for a published value matching `f`.
async fn next_matching(
    watch: &mut WatchStream<Option<Arc<Snapshot>>>,
    f: impl Fn(&Option<Arc<Snapshot>>) -> bool,
) -> Option<Arc<Snapshot>> {
    time::timeout(time::Duration::from_secs(30), async {
        loop {
            let published = watch.next().await.expect("watch must not end");
            if f(&published) {
                return published;
            }
        }
    })
    .await
    .expect("timed out waiting for a snapshot")
}

#[tokio::test(start_paused = true)]
async fn reconciles_connected_proxies() {
    let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
    resources::load(&store, RESOURCES).expect("resources must load");
    let mut prom = Registry::default();
    let control_plane = mk_control_plane(store.clone(), &mut prom);

    let mut watch = control_plane.snapshots().watch("default.web-1");
    let stream = control_plane
        .connect("default.web-1", &DataplaneMetadata::default())
        .await
        .expect("connect");
    assert_eq!(
        control_plane.stream_proxy(stream),
        Some(ProxyId::new("default", "web-1"))
    );
    assert_eq!(control_plane.tracker().watched(), 1);

    let snapshot = next_matching(&mut watch, Option::is_some)
        .await
        .expect("snapshot");
    assert!(has_fault(&snapshot));
    match snapshot.get(TypeUrl::Endpoint, "backend") {
        Some(Resource::Endpoint(cla)) => assert_eq!(cla.endpoints.len(), 1),
        other => panic!("unexpected load assignment: {other:?}"),
    }
    snapshot.consistent().expect("snapshot must be consistent");

    // Policy changes are picked up once the mesh is rebuilt.
    store
        .delete(
            ResourceType::FaultInjection,
            &ResourceKey::new("default", "web-faults"),
        )
        .expect("delete");
    control_plane.mesh_cache().invalidate("default");
    let updated = next_matching(&mut watch, |s| s.as_deref().is_some_and(|s| !has_fault(s)))
        .await
        .expect("snapshot");
    assert_ne!(
        updated.version(TypeUrl::Listener),
        snapshot.version(TypeUrl::Listener)
    );
    assert_eq!(
        updated.version(TypeUrl::Endpoint),
        snapshot.version(TypeUrl::Endpoint)
    );

    // The last stream closing withdraws the configuration.
    control_plane.disconnect(stream).await;
    assert_eq!(control_plane.tracker().watched(), 0);
    assert_eq!(current(&control_plane), None);
    next_matching(&mut watch, Option::is_none).await;

    let mut metrics = String::new();
    prometheus_client::encoding::text::encode(&mut metrics, &prom).expect("encode");
    assert!(metrics.contains("xds_streams"), "{metrics}");
    assert!(metrics.contains("watchdog_"), "{metrics}");
}

#[tokio::test(start_paused = true)]
async fn invalid_identities_are_not_watched() {
    let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
    resources::load(&store, RESOURCES).expect("resources must load");
    let control_plane = mk_control_plane(store, &mut Registry::default());

    let stream = control_plane
        .connect("web-1", &DataplaneMetadata::default())
        .await
        .expect("connect");
    assert_eq!(control_plane.stream_proxy(stream), None);
    assert_eq!(control_plane.tracker().watched(), 0);
    assert!(control_plane
        .status()
        .proxy_statuses(&ProxyId::new("", "web-1"))
        .is_empty());
    control_plane.disconnect(stream).await;
}

#[tokio::test(start_paused = true)]
async fn streams_for_one_proxy_share_a_watchdog() {
    let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
    resources::load(&store, RESOURCES).expect("resources must load");
    let control_plane = mk_control_plane(store, &mut Registry::default());
    let mut watch = control_plane.snapshots().watch("default.web-1");

    let first = control_plane
        .connect("default.web-1", &DataplaneMetadata::default())
        .await
        .expect("connect");
    let second = control_plane
        .connect("default.web-1", &DataplaneMetadata::default())
        .await
        .expect("connect");
    assert_eq!(control_plane.tracker().watched(), 1);
    assert_eq!(
        control_plane
            .status()
            .proxy_statuses(&ProxyId::new("default", "web-1"))
            .len(),
        2
    );
    next_matching(&mut watch, Option::is_some).await;

    control_plane.disconnect(first).await;
    assert_eq!(control_plane.tracker().watched(), 1);
    assert!(current(&control_plane).is_some());

    control_plane.disconnect(second).await;
    assert_eq!(control_plane.tracker().watched(), 0);
    assert!(current(&control_plane).is_none());
}

fn current(control_plane: &ControlPlane) -> Option<Arc<Snapshot>> {
    control_plane.snapshots().get_snapshot("default.web-1")
}
