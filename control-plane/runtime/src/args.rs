use crate::{
    control_plane::{Config, ControlPlane},
    core::{DataplaneMetadata, MemoryStore, ProxyType, SystemClock},
    resources,
    sync::DnsResolver,
};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::{self, Duration};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "mesh", about = "A service mesh control plane")]
pub struct Args {
    #[clap(long, default_value = "mesh=info,warn", env = "MESH_CONTROL_PLANE_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain", env = "MESH_CONTROL_PLANE_LOG_FORMAT")]
    log_format: LogFormat,

    /// A JSON list of resources to load into the store.
    #[clap(long, env = "MESH_CONTROL_PLANE_RESOURCES")]
    resources: PathBuf,

    #[clap(long, default_value = "zone-1", env = "MESH_CONTROL_PLANE_ZONE")]
    zone: String,

    #[clap(long, default_value = "1000", env = "MESH_CONTROL_PLANE_SYNC_INTERVAL_MS")]
    sync_interval_ms: u64,

    #[clap(
        long,
        default_value = "1000",
        env = "MESH_CONTROL_PLANE_MESH_CACHE_EXPIRATION_MS"
    )]
    mesh_cache_expiration_ms: u64,

    /// Prints the first configuration generated for a proxy (`mesh.name`) and exits.
    #[clap(long, env = "MESH_CONTROL_PLANE_DUMP_NODE")]
    dump_node: Option<String>,

    #[clap(long, default_value = "10000", env = "MESH_CONTROL_PLANE_DUMP_TIMEOUT_MS")]
    dump_timeout_ms: u64,

    /// Proxies to keep connected until interrupted. May be repeated.
    #[clap(long = "node", env = "MESH_CONTROL_PLANE_NODES", value_delimiter = ',')]
    nodes: Vec<String>,

    /// The type reported by the proxies given with `--node` or `--dump-node`.
    #[clap(long, default_value = "sidecar", env = "MESH_CONTROL_PLANE_PROXY_TYPE")]
    proxy_type: ProxyType,

    /// Prints the metrics registry before exiting.
    #[clap(long, env = "MESH_CONTROL_PLANE_PRINT_METRICS")]
    print_metrics: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Plain,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            resources: path,
            zone,
            sync_interval_ms,
            mesh_cache_expiration_ms,
            dump_node,
            dump_timeout_ms,
            nodes,
            proxy_type,
            print_metrics,
        } = self;

        init_tracing(&log_level, log_format)?;

        let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
        let loaded = resources::load_file(&store, &path)?;
        info!(resources = loaded, path = %path.display(), "Loaded resources");

        let mut prom = <Registry>::default();
        let control_plane = ControlPlane::new(
            store,
            Arc::new(DnsResolver),
            Config {
                zone,
                sync_interval: Duration::from_millis(sync_interval_ms),
                mesh_cache_expiration: Duration::from_millis(mesh_cache_expiration_ms),
            },
            &mut prom,
        );
        let metadata = DataplaneMetadata {
            proxy_type,
            ..Default::default()
        };

        match dump_node {
            Some(node) => {
                dump(
                    &control_plane,
                    &node,
                    &metadata,
                    Duration::from_millis(dump_timeout_ms),
                )
                .await?
            }
            None => serve(&control_plane, &nodes, &metadata).await?,
        }

        if print_metrics {
            let mut text = String::new();
            prometheus_client::encoding::text::encode(&mut text, &prom)?;
            print!("{text}");
        }
        Ok(())
    }
}

fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)?;
    let init = match format {
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
    init.map_err(|error| anyhow!("failed to initialize logging: {error}"))
}

/// Connects a single proxy and prints the first snapshot published for it.
async fn dump(
    control_plane: &ControlPlane,
    node: &str,
    metadata: &DataplaneMetadata,
    timeout: Duration,
) -> Result<()> {
    let mut published = control_plane.snapshots().watch(node).filter_map(|s| s);
    let stream = control_plane.connect(node, metadata).await?;
    if control_plane.stream_proxy(stream).is_none() {
        control_plane.disconnect(stream).await;
        bail!("invalid proxy id: {node}");
    }

    let snapshot = time::timeout(timeout, published.next()).await;
    control_plane.disconnect(stream).await;
    match snapshot {
        Ok(Some(snapshot)) => {
            println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            Ok(())
        }
        Ok(None) => bail!("snapshot watch for {node} ended"),
        Err(_) => bail!("timed out waiting for a snapshot for {node}"),
    }
}

/// Keeps the given proxies connected until interrupted.
async fn serve(
    control_plane: &ControlPlane,
    nodes: &[String],
    metadata: &DataplaneMetadata,
) -> Result<()> {
    let mut streams = Vec::with_capacity(nodes.len());
    for node in nodes {
        streams.push(control_plane.connect(node, metadata).await?);
    }
    if streams.is_empty() {
        warn!("No proxies given; waiting for interrupt");
    }

    if tokio::signal::ctrl_c().await.is_err() {
        bail!("Aborted");
    }
    info!(proxies = control_plane.tracker().watched(), "Shutting down");
    for stream in streams {
        control_plane.disconnect(stream).await;
    }
    Ok(())
}

// === impl LogFormat ===

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            s => bail!("unknown log format: {s:?}"),
        }
    }
}
