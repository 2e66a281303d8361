//! Turns proxy descriptors into versioned discovery snapshots and tracks the discovery
//! streams that consume them.
//!
//! A [`Reconciler`] generates, versions and publishes a proxy's [`Snapshot`] into a
//! [`SnapshotCache`]. Stream events reach a [`CallbacksChain`] holding a [`StatusTracker`],
//! which records how proxies answer, and a [`SyncTracker`], which runs one watchdog per
//! connected proxy.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod callbacks;
mod error;
pub mod generator;
mod metrics;
mod reconciler;
pub mod resources;
mod secrets;
pub mod snapshot;
pub mod status;
mod tracker;
mod versioner;

pub use self::{
    cache::{MemorySnapshotCache, SnapshotCache},
    callbacks::{CallbacksChain, DiscoveryRequest, DiscoveryResponse, StreamCallbacks, StreamId},
    error::Error,
    generator::{ProfileGenerator, ResourceGenerator},
    metrics::XdsMetrics,
    reconciler::Reconciler,
    secrets::Secrets,
    snapshot::Snapshot,
    status::StatusTracker,
    tracker::{NewWatchdog, SyncTracker},
    versioner::Versioner,
};
