use mesh_control_plane_core::{ProxyType, ResourceKey, ResourceType, StoreError};
use std::sync::Arc;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{rtype} {key} not found")]
    NotFound { rtype: ResourceType, key: ResourceKey },

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("cannot build a {0} proxy from this mesh context")]
    UnexpectedContext(ProxyType),

    #[error("failed to reconcile: {0:#}")]
    Reconcile(Arc<anyhow::Error>),
}

// === impl Error ===

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) => e.is_not_found(),
            Self::NotFound { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn not_found(rtype: ResourceType, key: ResourceKey) -> Self {
        Self::NotFound { rtype, key }
    }
}
