use crate::{
    cache::SnapshotCache,
    generator::{identity_secret, ResourceGenerator},
    resources::TypeUrl,
    secrets::Secrets,
    snapshot::Snapshot,
    versioner::Versioner,
};
use mesh_control_plane_core::{Proxy, ProxyId, Reconcile};
use std::sync::Arc;
use tracing::{debug, warn};

/// Generates a proxy's snapshot, versions it against the published one and publishes it if
/// anything changed.
#[derive(Clone)]
pub struct Reconciler {
    generator: Arc<dyn ResourceGenerator>,
    versioner: Versioner,
    secrets: Arc<Secrets>,
    cache: Arc<dyn SnapshotCache>,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        generator: Arc<dyn ResourceGenerator>,
        versioner: Versioner,
        secrets: Arc<Secrets>,
        cache: Arc<dyn SnapshotCache>,
    ) -> Self {
        Self {
            generator,
            versioner,
            secrets,
            cache,
        }
    }
}

impl Reconcile for Reconciler {
    fn reconcile(&self, proxy: &Proxy) -> anyhow::Result<bool> {
        let node = proxy.id.to_string();
        let resources = self.generator.generate(proxy)?;
        // Certificates the proxy no longer serves must not keep forcing passes.
        self.secrets.retain(&proxy.id, |mesh| {
            resources
                .get(TypeUrl::Secret, &identity_secret(mesh))
                .is_some()
        });
        let previous = self.cache.get_snapshot(&node);
        let snapshot = self
            .versioner
            .version(Snapshot::new(resources), previous.as_deref());

        if let Err(error) = snapshot.consistent() {
            warn!(proxy = %proxy.id, %error, "Publishing inconsistent snapshot");
        }
        if previous.as_deref() == Some(&snapshot) {
            return Ok(false);
        }

        debug!(proxy = %proxy.id, resources = snapshot.len(), "Publishing snapshot");
        self.cache.set_snapshot(&node, snapshot);
        Ok(true)
    }

    fn clear(&self, id: &ProxyId) {
        debug!(proxy = %id, "Clearing snapshot");
        self.cache.clear_snapshot(&id.to_string());
        self.secrets.clear(id);
    }

    fn credentials_expiring(&self, id: &ProxyId) -> bool {
        self.secrets.expiring(id)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("versioner", &self.versioner)
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MemorySnapshotCache,
        resources::{
            Cluster, ClusterLoadAssignment, Direction, Discovery, Filter, FilterChain, Listener,
            ResourceSet, Secret, SecretKind, TypeUrl, WeightedCluster,
        },
        Error,
    };
    use chrono::{DateTime, Duration, Utc};
    use mesh_control_plane_core::{
        dataplane::{ZoneEgress, ZoneProxyNetworking},
        mesh::CaBackend,
        policy::LoadBalancer,
        proxy::EgressProxy,
        Clock, DataplaneMetadata, IdGenerator, Meta, ProxyKind, Resource,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns whatever resources it is told to, or fails when it holds none.
    #[derive(Default)]
    struct FakeGenerator(Mutex<Option<ResourceSet>>);

    impl ResourceGenerator for FakeGenerator {
        fn generate(&self, _: &Proxy) -> Result<ResourceSet, Error> {
            self.0
                .lock()
                .clone()
                .ok_or_else(|| Error::UnknownProfile("fake".to_string()))
        }
    }

    #[derive(Default)]
    struct SequentialIds(AtomicUsize);

    impl IdGenerator for SequentialIds {
        fn next_id(&self) -> String {
            self.0.fetch_add(1, Ordering::SeqCst).to_string()
        }
    }

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    struct Fixture {
        generator: Arc<FakeGenerator>,
        clock: Arc<ManualClock>,
        secrets: Arc<Secrets>,
        cache: Arc<MemorySnapshotCache>,
        reconciler: Reconciler,
        proxy: Proxy,
    }

    impl Fixture {
        fn new() -> Self {
            let generator = Arc::new(FakeGenerator::default());
            let clock = Arc::new(ManualClock(Mutex::new(DateTime::<Utc>::UNIX_EPOCH)));
            let secrets = Arc::new(Secrets::new(clock.clone()));
            let cache = Arc::new(MemorySnapshotCache::default());
            let reconciler = Reconciler::new(
                generator.clone(),
                Versioner::new(Arc::new(SequentialIds::default())),
                secrets.clone(),
                cache.clone(),
            );
            Self {
                generator,
                clock,
                secrets,
                cache,
                reconciler,
                proxy: mk_proxy(),
            }
        }

        fn set(&self, resources: ResourceSet) {
            *self.generator.0.lock() = Some(resources);
        }

        fn published(&self) -> Option<Arc<Snapshot>> {
            self.cache.get_snapshot(".egress-1")
        }
    }

    fn mk_proxy() -> Proxy {
        let zone_egress = ZoneEgress {
            zone: "zone-1".to_string(),
            networking: ZoneProxyNetworking {
                address: "10.0.9.2".to_string(),
                port: 10002,
                ..Default::default()
            },
        };
        Proxy {
            id: ProxyId::new("", "egress-1"),
            metadata: DataplaneMetadata::default(),
            zone: "zone-1".to_string(),
            kind: ProxyKind::Egress(EgressProxy {
                zone_egress: Arc::new(Resource {
                    meta: Meta {
                        mesh: String::new(),
                        name: "egress-1".to_string(),
                        version: "1".to_string(),
                        creation_time: DateTime::<Utc>::UNIX_EPOCH,
                        modification_time: DateTime::<Utc>::UNIX_EPOCH,
                    },
                    spec: zone_egress,
                }),
                meshes: vec![],
            }),
        }
    }

    fn mk_cluster(name: &str, connect_timeout_ms: u64) -> Cluster {
        Cluster {
            name: name.to_string(),
            discovery: Discovery::Eds,
            connect_timeout_ms,
            lb_policy: LoadBalancer::RoundRobin,
            circuit_breakers: None,
            health_check: None,
            tls: None,
        }
    }

    fn mk_resources(connect_timeout_ms: u64) -> ResourceSet {
        let mut set = ResourceSet::default();
        set.add(mk_cluster("backend", connect_timeout_ms));
        set.add(ClusterLoadAssignment {
            cluster_name: "backend".to_string(),
            endpoints: vec![],
        });
        set.add(Listener {
            name: "egress:10.0.9.2:10002".to_string(),
            address: "10.0.9.2".to_string(),
            port: 10002,
            direction: Direction::Inbound,
            filter_chains: vec![FilterChain {
                name: "backend".to_string(),
                filters: vec![Filter::TcpProxy {
                    stat_prefix: "backend".to_string(),
                    clusters: vec![WeightedCluster {
                        name: "backend".to_string(),
                        weight: 1,
                    }],
                    access_log: None,
                    idle_timeout_ms: None,
                }],
                ..Default::default()
            }],
        });
        set
    }

    #[test]
    fn publishes_only_changes() {
        let fixture = Fixture::new();
        fixture.set(mk_resources(1000));

        assert!(fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile"));
        let first = fixture.published().expect("snapshot must be published");
        assert_eq!(first.len(), 3);

        assert!(!fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile"));
        let second = fixture.published().expect("snapshot must be published");
        assert!(Arc::ptr_eq(&first, &second), "unchanged snapshots are not republished");
    }

    #[test]
    fn cluster_only_change_bumps_the_cluster_version() {
        let fixture = Fixture::new();
        fixture.set(mk_resources(1000));
        fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile");
        let first = fixture.published().expect("snapshot must be published");

        fixture.set(mk_resources(250));
        assert!(fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile"));
        let second = fixture.published().expect("snapshot must be published");

        for type_url in TypeUrl::ALL {
            if type_url == TypeUrl::Cluster {
                assert_ne!(first.version(type_url), second.version(type_url));
            } else {
                assert_eq!(first.version(type_url), second.version(type_url), "{type_url:?}");
            }
        }
    }

    #[test]
    fn inconsistent_snapshots_are_still_published() {
        let fixture = Fixture::new();
        let mut resources = mk_resources(1000);
        resources.add(mk_cluster("orphan", 1000));
        fixture.set(resources);

        assert!(fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile"));
        let published = fixture.published().expect("snapshot must be published");
        assert!(published.consistent().is_err());
        assert!(published.get(TypeUrl::Cluster, "orphan").is_some());
    }

    #[test]
    fn generation_errors_leave_the_published_snapshot() {
        let fixture = Fixture::new();
        fixture.set(mk_resources(1000));
        fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile");
        let published = fixture.published();

        *fixture.generator.0.lock() = None;
        fixture
            .reconciler
            .reconcile(&fixture.proxy)
            .expect_err("generation must fail");
        assert_eq!(fixture.published(), published);
    }

    #[test]
    fn credentials_no_longer_generated_stop_expiring() {
        let fixture = Fixture::new();
        let backend = CaBackend {
            name: "ca-1".to_string(),
            kind: "builtin".to_string(),
            cert_validity_secs: 100,
        };
        let cert = fixture.secrets.identity(
            &fixture.proxy.id,
            "default",
            &backend,
            vec!["spiffe://default/zone-egress".to_string()],
        );
        let mut with_mtls = mk_resources(1000);
        with_mtls.add(Secret {
            name: identity_secret("default"),
            kind: SecretKind::IdentityCert(cert),
        });
        fixture.set(with_mtls);
        fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile");

        *fixture.clock.0.lock() += Duration::seconds(90);
        assert!(fixture.reconciler.credentials_expiring(&fixture.proxy.id));

        // The mesh disabled mTLS: the next pass no longer generates the certificate.
        fixture.set(mk_resources(1000));
        fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile");
        assert!(!fixture.reconciler.credentials_expiring(&fixture.proxy.id));
        *fixture.clock.0.lock() += Duration::seconds(3600);
        assert!(!fixture.reconciler.credentials_expiring(&fixture.proxy.id));
    }

    #[test]
    fn clear_withdraws_the_snapshot_and_credentials() {
        let fixture = Fixture::new();
        fixture.set(mk_resources(1000));
        fixture.reconciler.reconcile(&fixture.proxy).expect("reconcile");

        let backend = CaBackend {
            name: "ca-1".to_string(),
            kind: "builtin".to_string(),
            cert_validity_secs: 100,
        };
        fixture.secrets.identity(
            &fixture.proxy.id,
            "default",
            &backend,
            vec!["spiffe://default/zone-egress".to_string()],
        );
        assert!(!fixture.reconciler.credentials_expiring(&fixture.proxy.id));
        *fixture.clock.0.lock() += Duration::seconds(90);
        assert!(fixture.reconciler.credentials_expiring(&fixture.proxy.id));

        fixture.reconciler.clear(&fixture.proxy.id);
        assert_eq!(fixture.published(), None);
        assert!(!fixture.reconciler.credentials_expiring(&fixture.proxy.id));
    }
}
