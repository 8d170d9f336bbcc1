//! orbitgate-storage: the two storage tiers of the admission pipeline.
//!
//! - [`backend`] / [`state_store`]: ephemeral hot state, view history and work queues
//! - [`durable`] / [`persistence`]: the system of record and its buffered write path

pub mod backend;
pub mod state_store;
pub mod durable;
pub mod persistence;

pub use backend::{KeyValueBackend, MemoryBackend};
pub use state_store::{BestFrames, HotField, HotObject, QuarantineEntry, StateStore, WorkQueue};
pub use durable::{DurableStore, MemoryDurableStore, RecordBatch, SledStore};
pub use persistence::{FlushReport, ObjectPersistence};
