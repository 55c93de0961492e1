//! # riptide-meta - Metadata-store coordination for riptide
//!
//! The replication cluster coordinates through a shared, linearizable KV
//! store with revisions, leases and prefix watches (an etcd-class store).
//! This crate provides:
//!
//! - [`MetaStore`]: the narrow store contract the core depends on
//! - [`MemMetaStore`]: a deterministic in-memory implementation used by
//!   tests and standalone deployments
//! - [`keys`]: the key layout under a configured prefix
//! - [`MetaClient`]: typed JSON accessors for every persisted shape, plus
//!   capture registration and the owner election lock

pub mod client;
pub mod keys;
pub mod mem;
pub mod store;

pub use client::{MetaClient, OwnerLock};
pub use keys::KeySpace;
pub use mem::MemMetaStore;
pub use store::{
    KeyValue, LeaseId, MetaError, MetaStore, Result, Revision, WatchEvent, WatchEventKind,
};
