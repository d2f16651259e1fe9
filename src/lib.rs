//! docpipe: a checkpointed pipeline engine for document analysis
//!
//! Steps transform a shared [`Context`] and compose sequentially, as
//! parallel groups, or as per-item fan-outs. The analyzer batches items into
//! model calls with retry and model fallback; the orchestrator runs whole
//! assessments (triage, text, visual, persist) and resumes interrupted runs
//! from checkpoints.

pub mod analyzer;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod telemetry;

#[cfg(test)]
mod scenarios;

pub use analyzer::{
    BatchAnalyzer, BatchTask, CallRequest, CallResponse, ModelClient, OpenAiCompatClient, Outcome,
};
pub use checkpoint::{BlobStore, CheckpointStore, FileBlobStore, MemoryBlobStore};
pub use config::{HttpClientConfig, PhaseLimits, PipelineConfig, RetryPolicy};
pub use error::{CallError, CheckpointError, ItemError, PipelineError};
pub use orchestrator::{new_run_id, AssessmentOrchestrator, AssessmentReport, WorkItem};
pub use pipeline::{Context, SequentialPipeline, Step};
pub use telemetry::init_tracing;
