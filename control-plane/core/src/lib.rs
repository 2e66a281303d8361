#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod dataplane;
pub mod mesh;
pub mod policy;
pub mod policy_match;
pub mod proxy;
pub mod resource;
pub mod store;
mod tags;

pub use self::{
    clock::{Clock, IdGenerator, SystemClock, UuidGenerator},
    policy_match::PolicyRef,
    proxy::{DataplaneMetadata, Proxy, ProxyId, ProxyKind, ProxyType, Reconcile},
    resource::{Meta, Resource, ResourceKey, ResourceType, Spec},
    store::{MemoryStore, ResourceStore, StoreError},
    tags::{SelectorRank, TagSelector, Tags, MATCH_ALL, PROTOCOL_TAG, SERVICE_TAG, ZONE_TAG},
};
