use serde::{Deserialize, Serialize};

/// Mesh-wide settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSpec {
    #[serde(default)]
    pub mtls: Option<Mtls>,

    #[serde(default)]
    pub logging: Option<Logging>,

    #[serde(default)]
    pub routing: MeshRouting,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mtls {
    /// The name of the CA backend that issues identities. mTLS is disabled when unset.
    #[serde(default)]
    pub enabled_backend: Option<String>,

    #[serde(default)]
    pub backends: Vec<CaBackend>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaBackend {
    pub name: String,

    #[serde(default = "CaBackend::default_kind")]
    pub kind: String,

    /// How long issued identity certificates are valid for.
    #[serde(default = "CaBackend::default_cert_validity_secs")]
    pub cert_validity_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default)]
    pub default_backend: Option<String>,

    #[serde(default)]
    pub backends: Vec<LoggingBackend>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoggingBackend {
    pub name: String,

    #[serde(default)]
    pub format: Option<String>,

    pub sink: LogSink,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogSink {
    File { path: String },
    Tcp { address: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshRouting {
    /// Routes traffic to external services and other zones through zone egresses.
    #[serde(default)]
    pub zone_egress: bool,

    #[serde(default)]
    pub locality_aware_load_balancing: bool,
}

// === impl MeshSpec ===

impl MeshSpec {
    /// Returns the CA backend that issues identities when mTLS is enabled.
    pub fn enabled_ca_backend(&self) -> Option<&CaBackend> {
        let mtls = self.mtls.as_ref()?;
        let enabled = mtls.enabled_backend.as_deref()?;
        mtls.backends.iter().find(|b| b.name == enabled)
    }

    pub fn mtls_enabled(&self) -> bool {
        self.enabled_ca_backend().is_some()
    }

    /// Zone egress is only usable when mTLS is enabled.
    pub fn zone_egress_enabled(&self) -> bool {
        self.routing.zone_egress && self.mtls_enabled()
    }

    pub fn locality_aware_lb(&self) -> bool {
        self.routing.locality_aware_load_balancing
    }

    /// Resolves a logging backend by name, falling back to the mesh default when no name is
    /// given.
    pub fn logging_backend(&self, name: Option<&str>) -> Option<&LoggingBackend> {
        let logging = self.logging.as_ref()?;
        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => logging.default_backend.as_deref()?,
        };
        logging.backends.iter().find(|b| b.name == name)
    }
}

// === impl CaBackend ===

impl CaBackend {
    fn default_kind() -> String {
        "builtin".to_string()
    }

    fn default_cert_validity_secs() -> u64 {
        24 * 60 * 60
    }
}
