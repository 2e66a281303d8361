use super::*;
use crate::tests::{mk_dataplane, CountingStore, StaticResolver, TestConfig, ZONE};
use mesh_control_plane_core::{
    dataplane::{ZoneIngress, ZoneProxyNetworking},
    mesh::MeshSpec,
    StoreError, Tags,
};
use tokio::time::Duration;

fn mk_mesh(test: &TestConfig, name: &str) {
    test.store
        .store()
        .create("", name, MeshSpec::default())
        .expect("mesh must be created");
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_build() {
    let test = TestConfig::new(Duration::from_millis(100));
    mk_mesh(&test, "default");
    test.store
        .store()
        .create(
            "default",
            "web-1",
            mk_dataplane("10.0.0.1", [(8080, Tags::from([("service", "web")]))], []),
        )
        .unwrap();

    let snapshots = futures::future::join_all((0..50).map(|_| test.cache.snapshot("default"))).await;

    let first = snapshots[0].as_ref().expect("snapshot must build").clone();
    for snapshot in &snapshots {
        let snapshot = snapshot.as_ref().expect("snapshot must build");
        assert!(Arc::ptr_eq(&first, snapshot));
    }
    for rtype in MESH_TYPES {
        assert_eq!(test.store.lists(rtype), 1, "{rtype} must be listed once");
    }
    assert_eq!(first.dataplanes().len(), 1);
    assert_eq!(test.cache.cached_meshes(), 1);
}

#[tokio::test(start_paused = true)]
async fn caches_until_expiration() {
    let test = TestConfig::default();
    mk_mesh(&test, "default");

    let hash = test.cache.hash("default").await.unwrap();
    test.store
        .store()
        .create("default", "web-1", mk_dataplane("10.0.0.1", [], []))
        .unwrap();

    // Still cached: the new dataplane is not visible.
    assert_eq!(test.cache.hash("default").await.unwrap(), hash);
    assert_eq!(test.store.lists(ResourceType::Dataplane), 1);

    time::advance(Duration::from_millis(1001)).await;
    let updated = test.cache.hash("default").await.unwrap();
    assert_ne!(updated, hash);
    assert_eq!(test.store.lists(ResourceType::Dataplane), 2);
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_rebuild() {
    let test = TestConfig::default();
    mk_mesh(&test, "default");

    let hash = test.cache.hash("default").await.unwrap();
    test.store
        .store()
        .create("default", "web-1", mk_dataplane("10.0.0.1", [], []))
        .unwrap();
    test.cache.invalidate("default");

    assert_ne!(test.cache.hash("default").await.unwrap(), hash);
    assert_eq!(test.store.lists(ResourceType::Dataplane), 2);
}

#[tokio::test(start_paused = true)]
async fn invalidate_discards_builds_in_flight() {
    let test = TestConfig::new(Duration::from_millis(100));
    mk_mesh(&test, "default");

    // Dataplanes are listed first, so the build in flight has already missed web-1.
    let (stale, ()) = tokio::join!(test.cache.snapshot("default"), async {
        time::sleep(Duration::from_millis(150)).await;
        test.store
            .store()
            .create("default", "web-1", mk_dataplane("10.0.0.1", [], []))
            .unwrap();
        test.cache.invalidate("default");
    });
    assert_eq!(stale.expect("snapshot must build").dataplanes().len(), 0);
    assert_eq!(test.cache.cached_meshes(), 0);

    let fresh = test.cache.snapshot("default").await.expect("snapshot must build");
    assert_eq!(fresh.dataplanes().len(), 1);
    assert_eq!(test.store.lists(ResourceType::Dataplane), 2);
    assert_eq!(test.cache.cached_meshes(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_meshes_are_forgotten() {
    let test = TestConfig::default();
    mk_mesh(&test, "default");
    mk_mesh(&test, "other");
    test.cache.snapshot("default").await.unwrap();
    test.cache.snapshot("other").await.unwrap();
    assert_eq!(test.cache.cached_meshes(), 2);

    test.store
        .store()
        .delete(ResourceType::Mesh, &ResourceKey::global("other"))
        .unwrap();
    time::advance(Duration::from_millis(1001)).await;

    test.cache.snapshot("default").await.unwrap();
    assert_eq!(test.cache.cached_meshes(), 1);

    let error = test.cache.snapshot("other").await.unwrap_err();
    assert!(error.is_not_found(), "{error}");
    assert_eq!(test.cache.cached_meshes(), 1);
}

#[tokio::test(start_paused = true)]
async fn errors_are_not_cached() {
    let test = TestConfig::default();
    mk_mesh(&test, "default");

    test.store.set_failing(true);
    let error = test
        .cache
        .snapshot("default")
        .await
        .expect_err("store must fail");
    assert!(matches!(error, Error::Store(StoreError::Unavailable(_))), "{error}");
    assert!(!error.is_not_found());
    assert_eq!(test.cache.cached_meshes(), 0);

    test.store.set_failing(false);
    test.cache
        .snapshot("default")
        .await
        .expect("store must recover");
    assert_eq!(test.cache.cached_meshes(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_mesh_is_not_found() {
    let test = TestConfig::default();
    let error = test.cache.snapshot("missing").await.unwrap_err();
    assert!(error.is_not_found(), "{error}");
}

#[tokio::test(start_paused = true)]
async fn resolves_dataplane_hostnames() {
    let _tracing = crate::tests::init_tracing();
    let store = Arc::new(CountingStore::new(Duration::ZERO));
    store.store().create("", "default", MeshSpec::default()).unwrap();
    store
        .store()
        .create(
            "default",
            "web-1",
            mk_dataplane("web-1.local", [(8080, Tags::from([("service", "web")]))], []),
        )
        .unwrap();

    let resolver = StaticResolver(
        [("web-1.local".to_string(), "10.0.0.7".parse::<IpAddr>().unwrap())]
            .into_iter()
            .collect(),
    );
    let cache = MeshCache::new(store.clone(), Arc::new(resolver), ZONE, Duration::from_secs(1));
    let snapshot = cache.snapshot("default").await.unwrap();
    assert_eq!(
        snapshot.dataplane("web-1").unwrap().spec.networking.address,
        "10.0.0.7"
    );
    assert_eq!(snapshot.endpoints()["web"][0].target, "10.0.0.7");

    store
        .store()
        .create("default", "web-2", mk_dataplane("web-2.local", [], []))
        .unwrap();
    cache.invalidate("default");
    let error = cache.snapshot("default").await.unwrap_err();
    assert!(matches!(error, Error::Resolve { ref host, .. } if host == "web-2.local"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn global_snapshot_covers_all_meshes() {
    let test = TestConfig::default();
    mk_mesh(&test, "default");
    mk_mesh(&test, "other");
    test.store
        .store()
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

    let global = test.cache.global().await.unwrap();
    let names = global.meshes().iter().map(|m| m.name()).collect::<Vec<_>>();
    assert_eq!(names, vec!["default", "other"]);
    assert!(global.zone_ingress("ingress-1").is_some());
    assert!(global.zone_egress("ingress-1").is_none());

    let again = test.cache.global().await.unwrap();
    assert_eq!(global.hash(), again.hash());

    test.store
        .store()
        .create("other", "web-1", mk_dataplane("10.0.0.1", [], []))
        .unwrap();
    test.cache.invalidate("other");
    let changed = test.cache.global().await.unwrap();
    assert_ne!(global.hash(), changed.hash());
}

#[test]
fn collects_cache_metrics() {
    let test = TestConfig::default();
    let mut registry = Registry::default();
    register(&mut registry, &test.cache);
    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &registry).unwrap();
    assert!(text.contains("cached_meshes 0"), "{text}");
    assert!(text.contains("builds_in_flight 0"), "{text}");
}
