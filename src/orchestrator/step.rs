//! Runs a whole assessment as one suspendable pipeline step

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::runner::AssessmentOrchestrator;
use super::types::{AssessmentInput, WorkItem};
use crate::error::PipelineError;
use crate::pipeline::{Context, SuspendableStep};

/// Reads work items and document text from the context data; writes the
/// report under its own name.
pub struct AssessmentStep {
    name: String,
    orchestrator: Arc<AssessmentOrchestrator>,
    items_key: String,
    document_key: String,
}

impl AssessmentStep {
    pub fn new(name: impl Into<String>, orchestrator: Arc<AssessmentOrchestrator>) -> Self {
        Self {
            name: name.into(),
            orchestrator,
            items_key: "work_items".to_string(),
            document_key: "document_text".to_string(),
        }
    }

    pub fn with_keys(
        mut self,
        items_key: impl Into<String>,
        document_key: impl Into<String>,
    ) -> Self {
        self.items_key = items_key.into();
        self.document_key = document_key.into();
        self
    }
}

#[async_trait]
impl SuspendableStep for AssessmentStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        let items: Vec<WorkItem> = ctx.require_as(&self.name, &self.items_key)?;
        let document_text = match ctx.data.get(&self.document_key) {
            None => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(_) => {
                return Err(PipelineError::InvalidContextValue {
                    key: self.document_key.clone(),
                    reason: "expected a string".to_string(),
                })
            }
        };
        let input = AssessmentInput {
            assessment_id: ctx.assessment_id.clone(),
            document_text,
            items,
        };

        let run_id = ctx.run_id.clone();
        let outcome = self.orchestrator.run(&run_id, &input, None).await;
        match outcome {
            Ok(report) => {
                ctx.record(&self.name, "summary", serde_json::to_value(&report.summary)?);
                ctx.record(&self.name, "records", serde_json::to_value(&report.records)?);
                ctx.record(&self.name, "text", serde_json::to_value(&report.text)?);
                ctx.record(&self.name, "visual", serde_json::to_value(&report.visual)?);
                Ok(())
            }
            Err(failure) => {
                ctx.record(
                    &self.name,
                    "failure",
                    json!({
                        "last_completed_phase": failure.last_completed_phase,
                        "durably_processed": failure.durably_processed,
                        "error": failure.error.to_string(),
                    }),
                );
                Err(failure.error)
            }
        }
    }
}
