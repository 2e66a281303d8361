use crate::snapshot::Snapshot;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Holds the published snapshot of each node for the transport to serve.
pub trait SnapshotCache: Send + Sync + 'static {
    fn set_snapshot(&self, node: &str, snapshot: Snapshot);

    fn get_snapshot(&self, node: &str) -> Option<Arc<Snapshot>>;

    /// Withdraws a node's snapshot so that the transport pushes an empty configuration.
    fn clear_snapshot(&self, node: &str);
}

/// A [`SnapshotCache`] that keeps snapshots in memory and lets the transport watch them.
#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    nodes: Mutex<HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>>,
}

// === impl MemorySnapshotCache ===

impl MemorySnapshotCache {
    /// Streams the snapshots published for a node, starting with the current one. `None` is
    /// yielded while nothing is published and after a clear.
    pub fn watch(&self, node: &str) -> WatchStream<Option<Arc<Snapshot>>> {
        let rx = self
            .nodes
            .lock()
            .entry(node.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        WatchStream::new(rx)
    }

    pub fn nodes(&self) -> usize {
        self.nodes.lock().len()
    }
}

impl SnapshotCache for MemorySnapshotCache {
    fn set_snapshot(&self, node: &str, snapshot: Snapshot) {
        let snapshot = Some(Arc::new(snapshot));
        let mut nodes = self.nodes.lock();
        match nodes.get(node) {
            Some(tx) => {
                tx.send_replace(snapshot);
            }
            None => {
                nodes.insert(node.to_string(), watch::channel(snapshot).0);
            }
        }
    }

    fn get_snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.nodes.lock().get(node)?.borrow().clone()
    }

    fn clear_snapshot(&self, node: &str) {
        let mut nodes = self.nodes.lock();
        if let Some(tx) = nodes.get(node) {
            tx.send_replace(None);
            if tx.receiver_count() == 0 {
                nodes.remove(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceSet, Secret, SecretKind};
    use tokio_stream::StreamExt;

    fn mk_snapshot() -> Snapshot {
        let mut set = ResourceSet::default();
        set.add(Secret {
            name: "mesh_ca:secret:default".to_string(),
            kind: SecretKind::CaBundle {
                backend: "ca-1".to_string(),
            },
        });
        Snapshot::new(set)
    }

    #[tokio::test]
    async fn watch_sees_publish_and_clear() {
        let cache = MemorySnapshotCache::default();
        let mut updates = cache.watch("default.web-1");
        assert_eq!(updates.next().await, Some(None));

        cache.set_snapshot("default.web-1", mk_snapshot());
        let published = updates.next().await.flatten().expect("must be published");
        assert_eq!(published.len(), 1);
        assert_eq!(cache.get_snapshot("default.web-1"), Some(published));

        cache.clear_snapshot("default.web-1");
        assert_eq!(updates.next().await, Some(None));
        assert_eq!(cache.get_snapshot("default.web-1"), None);
        assert_eq!(cache.nodes(), 1);
    }

    #[test]
    fn clear_forgets_unwatched_nodes() {
        let cache = MemorySnapshotCache::default();
        cache.set_snapshot("default.web-1", mk_snapshot());
        assert!(cache.get_snapshot("default.web-1").is_some());

        cache.clear_snapshot("default.web-1");
        assert_eq!(cache.get_snapshot("default.web-1"), None);
        assert_eq!(cache.nodes(), 0);

        // Clearing an unknown node is a no-op.
        cache.clear_snapshot("default.web-2");
    }
}
