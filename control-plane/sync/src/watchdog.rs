use crate::{
    builder::{BuildProxy, MeshContext},
    mesh_cache::MeshCache,
    metrics::WatchdogMetrics,
    Error,
};
use mesh_control_plane_core::{DataplaneMetadata, ProxyId, ProxyType, Reconcile};
use std::{fmt, sync::Arc};
use tokio::time;
use tracing::{debug, info, warn};

/// Everything a watchdog needs beyond the identity of its proxy. Shared by all watchdogs.
#[derive(Clone)]
pub struct Dependencies {
    pub cache: MeshCache,
    pub builder: Arc<dyn BuildProxy>,
    pub reconciler: Arc<dyn Reconcile>,
    pub metrics: WatchdogMetrics,
}

/// Keeps the configuration of a single proxy up to date.
///
/// Each pass compares the fingerprint of the proxy's mesh against the one seen by the last
/// successful pass and only rebuilds when it changed (or when the proxy's credentials must be
/// renewed).
pub struct DataplaneWatchdog {
    id: ProxyId,
    metadata: DataplaneMetadata,
    deps: Dependencies,
    proxy_type: ProxyType,
    last_hash: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    /// Nothing relevant changed, or there was nothing to build.
    Skip,

    /// Configuration was generated and found identical to the published one.
    Generated,

    /// Configuration was generated and published.
    Changed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncResult {
    pub proxy_type: ProxyType,
    pub status: SyncStatus,
}

// === impl DataplaneWatchdog ===

impl DataplaneWatchdog {
    pub fn new(id: ProxyId, metadata: DataplaneMetadata, deps: Dependencies) -> Self {
        Self {
            proxy_type: metadata.proxy_type,
            id,
            metadata,
            deps,
            last_hash: None,
        }
    }

    /// Reconciles every `interval` until `shutdown` is signaled, then withdraws the proxy's
    /// configuration before releasing the shutdown.
    pub async fn run(mut self, interval: time::Duration, shutdown: drain::Watch) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        loop {
            tokio::select! {
                biased;

                release = &mut shutdown => {
                    self.cleanup();
                    drop(release);
                    return;
                }

                _ = ticks.tick() => self.tick().await,
            }
        }
    }

    /// Runs a single reconciliation pass.
    pub async fn sync(&mut self) -> Result<SyncResult, Error> {
        let ctx = if self.metadata.proxy_type.is_zone_proxy() {
            MeshContext::Global(self.deps.cache.global().await?)
        } else {
            match self.deps.cache.snapshot(&self.id.mesh).await {
                Ok(mesh) => MeshContext::Mesh(mesh),
                Err(error) if error.is_not_found() => {
                    info!(proxy = %self.id, %error, "Mesh not found");
                    return Ok(self.result(SyncStatus::Skip));
                }
                Err(error) => return Err(error),
            }
        };

        let hash = ctx.hash();
        if self.last_hash.as_deref() == Some(hash)
            && !self.deps.reconciler.credentials_expiring(&self.id)
        {
            return Ok(self.result(SyncStatus::Skip));
        }

        let proxy = match self.deps.builder.build(&self.id, &self.metadata, &ctx) {
            Ok(proxy) => proxy,
            Err(error) if error.is_not_found() => {
                info!(proxy = %self.id, %error, "Proxy resource not found");
                return Ok(self.result(SyncStatus::Skip));
            }
            Err(error) => return Err(error),
        };
        self.proxy_type = proxy.proxy_type();

        let changed = self
            .deps
            .reconciler
            .reconcile(&proxy)
            .map_err(|error| Error::Reconcile(Arc::new(error)))?;
        self.last_hash = Some(hash.to_string());

        let status = if changed {
            SyncStatus::Changed
        } else {
            SyncStatus::Generated
        };
        Ok(self.result(status))
    }

    /// Withdraws the configuration published for the proxy.
    pub fn cleanup(&mut self) {
        debug!(proxy = %self.id, "Cleaning up");
        self.deps.reconciler.clear(&self.id);
        self.last_hash = None;
    }

    async fn tick(&mut self) {
        let start = time::Instant::now();
        match self.sync().await {
            Ok(result) => {
                if result.status != SyncStatus::Skip {
                    debug!(
                        proxy = %self.id,
                        proxy_type = %result.proxy_type,
                        status = ?result.status,
                        "Reconciled",
                    );
                }
                self.deps
                    .metrics
                    .observe(result.proxy_type, result.status.as_str(), start.elapsed());
            }
            Err(error) => {
                warn!(proxy = %self.id, %error, "Failed to reconcile");
                self.deps.metrics.error(self.proxy_type);
                self.deps
                    .metrics
                    .observe(self.proxy_type, "error", start.elapsed());
            }
        }
    }

    fn result(&self, status: SyncStatus) -> SyncResult {
        SyncResult {
            proxy_type: self.proxy_type,
            status,
        }
    }
}

impl fmt::Debug for DataplaneWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataplaneWatchdog")
            .field("id", &self.id)
            .field("proxy_type", &self.proxy_type)
            .field("last_hash", &self.last_hash)
            .finish_non_exhaustive()
    }
}

// === impl SyncStatus ===

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Generated => "generated",
            Self::Changed => "changed",
        }
    }
}
