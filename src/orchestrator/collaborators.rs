//! Injected collaborators: cheap triage and the final result store

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::types::{FinalRecord, WorkItem};
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriageDecision {
    Relevant,
    /// Terminal without any model call
    NotApplicable { reason: String },
}

/// Deterministic first pass over each item. Must not call a model.
pub trait Triage: Send + Sync {
    fn triage(&self, item: &WorkItem, document_text: &str) -> TriageDecision;
}

impl<F> Triage for F
where
    F: Fn(&WorkItem, &str) -> TriageDecision + Send + Sync,
{
    fn triage(&self, item: &WorkItem, document_text: &str) -> TriageDecision {
        self(item, document_text)
    }
}

/// Every item goes on to text analysis
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Triage for AcceptAll {
    fn triage(&self, _item: &WorkItem, _document_text: &str) -> TriageDecision {
        TriageDecision::Relevant
    }
}

/// Durable destination for terminal records.
///
/// Checkpoints for a run are only cleared after `persist` returns `Ok`.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, run_id: &str, records: &[FinalRecord]) -> Result<(), PipelineError>;
}

/// In-process sink; keeps every persisted batch of records
#[derive(Debug, Default)]
pub struct MemorySink {
    persisted: Mutex<Vec<(String, Vec<FinalRecord>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records persisted for `run_id`, latest write wins
    pub async fn records(&self, run_id: &str) -> Option<Vec<FinalRecord>> {
        self.persisted
            .lock()
            .await
            .iter()
            .rev()
            .find(|(run, _)| run == run_id)
            .map(|(_, records)| records.clone())
    }

    pub async fn writes(&self) -> usize {
        self.persisted.lock().await.len()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist(&self, run_id: &str, records: &[FinalRecord]) -> Result<(), PipelineError> {
        self.persisted
            .lock()
            .await
            .push((run_id.to_string(), records.to_vec()));
        Ok(())
    }
}
