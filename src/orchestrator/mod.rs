//! Multi-phase assessment
//!
//! Items move through cheap triage, batched text analysis and (when the
//! text is not enough and images exist) multimodal analysis, then land in
//! the result sink. See `state` for the per-item state machine.

pub mod collaborators;
pub mod runner;
pub mod state;
pub mod step;
pub mod task;
pub mod types;

pub use collaborators::{AcceptAll, MemorySink, ResultSink, Triage, TriageDecision};
pub use runner::{new_run_id, AssessmentOrchestrator, PhaseRecord};
pub use state::{ItemLedger, ItemState};
pub use step::AssessmentStep;
pub use task::{FindingTask, Modality};
pub use types::{
    AssessmentFailure, AssessmentInput, AssessmentPhase, AssessmentProgress,
    AssessmentProgressFn, AssessmentReport, AssessmentSummary, FinalRecord, Finding,
    FindingStatus, WorkItem,
};
