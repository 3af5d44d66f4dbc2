//! All-or-nothing checkpoints of sharded model state.
//!
//! Shards of one step are uploaded independently by the ranks that own them;
//! a step only becomes visible to [`CheckpointStore::latest_committed`] once
//! every shard of its manifest has been verified. Anything else is left
//! `in-progress` for the liveness sweep to collect.

mod errors;
#[cfg(feature = "gcs")]
mod gcs;
mod object_store;
mod record;
mod store;

pub use errors::CheckpointError;
#[cfg(feature = "gcs")]
pub use gcs::GcsObjectStore;
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use record::{CheckpointRecord, CommitState, ResumePoint, ShardAck};
pub use store::{CheckpointStore, DEFAULT_ABANDON_AFTER, DEFAULT_KEEP_COMMITTED};
