use anyhow::{Context, Result};
use mesh_control_plane_core::{MemoryStore, ResourceType, Spec};
use serde::Deserialize;
use std::path::Path;

/// A resource as written in a resources file.
#[derive(Debug, Deserialize)]
struct Document {
    #[serde(rename = "type")]
    rtype: ResourceType,

    /// Empty for meshes, zone ingresses and zone egresses.
    #[serde(default)]
    mesh: String,

    name: String,

    #[serde(default)]
    spec: serde_json::Value,
}

/// Loads a JSON list of resources into the store, replacing existing resources with the same
/// type and key. Returns the number of resources loaded.
pub fn load(store: &MemoryStore, json: &str) -> Result<usize> {
    let documents: Vec<Document> = serde_json::from_str(json).context("invalid resource list")?;
    let count = documents.len();
    for Document {
        rtype,
        mesh,
        name,
        spec,
    } in documents
    {
        let spec =
            Spec::from_json(rtype, spec).with_context(|| format!("invalid {rtype} {name}"))?;
        store.upsert(&mesh, &name, spec)?;
        tracing::debug!(%rtype, %mesh, %name, "Loaded resource");
    }
    Ok(count)
}

pub fn load_file(store: &MemoryStore, path: &Path) -> Result<usize> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    load(store, &json)
}
