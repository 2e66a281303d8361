//! Turns the contents of a resource store into per-proxy configuration.
//!
//! A [`MeshCache`] keeps short-lived snapshots of every mesh, a [`ProxyBuilder`] resolves the
//! snapshot into the [`Proxy`](mesh_control_plane_core::Proxy) descriptor of a single proxy,
//! and a [`DataplaneWatchdog`] drives that pipeline periodically for each connected proxy.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod builder;
mod error;
pub mod mesh_cache;
mod metrics;
pub mod snapshot;
pub mod topology;
pub mod watchdog;


pub use self::{
    builder::{BuildProxy, MeshContext, ProxyBuilder},
    error::Error,
    mesh_cache::{DnsResolver, MeshCache, Resolve},
    metrics::WatchdogMetrics,
    snapshot::{GlobalSnapshot, MeshSnapshot},
    watchdog::{DataplaneWatchdog, Dependencies, SyncResult, SyncStatus},
};
