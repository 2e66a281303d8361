use crate::resources::IdentityCert;
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, Utc};
use mesh_control_plane_core::{mesh::CaBackend, Clock, ProxyId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Tracks the identity certificates issued to proxies, per proxy and mesh. Zone egresses hold
/// a certificate for each mesh they serve.
///
/// Certificates are reused until less than a fifth of their validity is left, the mesh's CA
/// backend changes, or the proxy's identities change.
pub struct Secrets {
    clock: Arc<dyn Clock>,
    issued: Mutex<HashMap<ProxyId, HashMap<String, IdentityCert>>>,
}

// === impl Secrets ===

impl Secrets {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            issued: Default::default(),
        }
    }

    /// Returns the proxy's certificate for a mesh, issuing a new one if needed.
    pub fn identity(
        &self,
        id: &ProxyId,
        mesh: &str,
        backend: &CaBackend,
        spiffe_ids: Vec<String>,
    ) -> IdentityCert {
        let now = self.clock.now();
        let mut issued = self.issued.lock();
        let issued = issued.entry(id.clone()).or_default();
        if let Some(cert) = issued.get(mesh) {
            if cert.backend == backend.name
                && cert.spiffe_ids == spiffe_ids
                && !Self::is_expiring(cert, now)
            {
                return cert.clone();
            }
        }

        let validity = i64::try_from(backend.cert_validity_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let cert = IdentityCert {
            backend: backend.name.clone(),
            spiffe_ids,
            issued_at: now,
            expires_at: now.checked_add_signed(validity).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        tracing::debug!(
            proxy = %id,
            %mesh,
            backend = %cert.backend,
            expires_at = %cert.expires_at,
            "Issued identity certificate",
        );
        issued.insert(mesh.to_string(), cert.clone());
        cert
    }

    /// Returns true if any of the proxy's certificates must be renewed soon.
    pub fn expiring(&self, id: &ProxyId) -> bool {
        let now = self.clock.now();
        self.issued
            .lock()
            .get(id)
            .is_some_and(|certs| certs.values().any(|cert| Self::is_expiring(cert, now)))
    }

    /// Stops tracking the proxy's certificates for meshes that `keep` rejects.
    pub fn retain(&self, id: &ProxyId, mut keep: impl FnMut(&str) -> bool) {
        let mut issued = self.issued.lock();
        if let Some(certs) = issued.get_mut(id) {
            certs.retain(|mesh, _| keep(mesh));
            if certs.is_empty() {
                issued.remove(id);
            }
        }
    }

    /// Stops tracking the proxy's certificates.
    pub fn clear(&self, id: &ProxyId) {
        self.issued.lock().remove(id);
    }

    fn is_expiring(cert: &IdentityCert, now: DateTime<Utc>) -> bool {
        let validity = cert.expires_at - cert.issued_at;
        cert.expires_at - now < validity / 5
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("proxies", &self.issued.lock().len())
            .finish_non_exhaustive()
    }
}
