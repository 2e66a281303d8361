use crate::{resources::TypeUrl, snapshot::Snapshot};
use mesh_control_plane_core::IdGenerator;
use std::sync::Arc;

/// Assigns versions to the groups of a snapshot.
///
/// A group keeps the version it has in the previously published snapshot as long as its
/// serialized contents are unchanged; otherwise it gets a fresh version.
#[derive(Clone)]
pub struct Versioner {
    ids: Arc<dyn IdGenerator>,
}

// === impl Versioner ===

impl Versioner {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self { ids }
    }

    pub fn version(&self, mut snapshot: Snapshot, previous: Option<&Snapshot>) -> Snapshot {
        for type_url in TypeUrl::ALL {
            let kept = previous.and_then(|previous| {
                let old = previous.group(type_url)?;
                let new = snapshot.group(type_url)?;
                if old.version.is_empty() {
                    return None;
                }
                let old_contents = serialized(&old.resources)?;
                (Some(old_contents) == serialized(&new.resources)).then(|| old.version.clone())
            });
            let version = kept.unwrap_or_else(|| self.ids.next_id());
            snapshot.set_version(type_url, version);
        }
        snapshot
    }
}

impl std::fmt::Debug for Versioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Versioner").finish_non_exhaustive()
    }
}

fn serialized<T: serde::Serialize>(resources: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(resources) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(%error, "Failed to serialize resources");
            None
        }
    }
}
