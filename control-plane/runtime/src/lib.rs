#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_control_plane_core as core;
pub use mesh_control_plane_sync as sync;
pub use mesh_control_plane_xds as xds;

mod args;
mod control_plane;
pub mod resources;

pub use self::{
    args::Args,
    control_plane::{Config, ControlPlane, WatchdogFactory},
};
