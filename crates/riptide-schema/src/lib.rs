//! # riptide-schema - Schema snapshots and the transaction mounter
//!
//! The mounter joins raw KV change entries with a point-in-time schema
//! snapshot to produce typed row-change events. The snapshot advances by
//! applying finished DDL jobs strictly in finished-ts order; the pipeline
//! guarantees the mounter never sees a row newer than the snapshot's
//! version for that row's table.

pub mod error;
pub mod mounter;
pub mod provider;
pub mod rowcodec;
pub mod snapshot;

pub use error::{Result, SchemaError};
pub use mounter::{unmarshal_ddl, Mounter};
pub use provider::{FixedSnapshotProvider, SnapshotProvider};
pub use snapshot::{SchemaDiff, SchemaInfoGetter, SchemaSnapshot};
