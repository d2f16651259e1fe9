//! Durable phase checkpoints for resumable runs

pub mod blob;
pub mod store;
pub mod writer;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use store::{checkpoint_key, Checkpoint, CheckpointStore, PhaseRecovery, RecoveryInfo};
pub use writer::CheckpointWriter;
