use super::{ca_secret, identity_secret, spiffe_id, ResourceGenerator};
use crate::{
    resources::{ResourceSet, Secret, SecretKind},
    secrets::Secrets,
    Error,
};
use mesh_control_plane_core::Proxy;
use std::{collections::BTreeSet, sync::Arc};

/// Generates the identity certificate and CA bundle of a dataplane when its mesh enables mTLS.
#[derive(Clone, Debug)]
pub struct SecretsGenerator {
    secrets: Arc<Secrets>,
}

impl SecretsGenerator {
    pub fn new(secrets: Arc<Secrets>) -> Self {
        Self { secrets }
    }
}

impl ResourceGenerator for SecretsGenerator {
    fn generate(&self, proxy: &Proxy) -> Result<ResourceSet, Error> {
        let mut resources = ResourceSet::default();
        let Some(dp) = proxy.as_dataplane() else {
            return Ok(resources);
        };
        let Some(backend) = dp.mesh.spec.enabled_ca_backend() else {
            return Ok(resources);
        };
        let mesh = dp.mesh.name();

        // One identity per service the dataplane serves.
        let spiffe_ids = dp
            .dataplane
            .spec
            .tag_sets()
            .filter_map(|tags| tags.service())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|service| spiffe_id(mesh, service))
            .collect();
        let cert = self.secrets.identity(&proxy.id, mesh, backend, spiffe_ids);

        resources.add(Secret {
            name: identity_secret(mesh),
            kind: SecretKind::IdentityCert(cert),
        });
        resources.add(Secret {
            name: ca_secret(mesh),
            kind: SecretKind::CaBundle {
                backend: backend.name.clone(),
            },
        });
        Ok(resources)
    }
}
