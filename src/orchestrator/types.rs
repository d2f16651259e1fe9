//! Assessment data model

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::ItemState;
use crate::analyzer::{BatchSummary, FallbackReason, ImageInput};
use crate::error::PipelineError;

/// One compliance check (or page, or region) to assess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// What the model is asked about this item
    pub description: String,
    /// Rendered evidence for the multimodal phase
    #[serde(default)]
    pub images: Vec<ImageInput>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }
}

/// Everything one assessment runs over
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentInput {
    pub assessment_id: Option<String>,
    /// Extracted document text shared by every batch
    pub document_text: String,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Compliant,
    #[serde(alias = "non-compliant")]
    NonCompliant,
    #[serde(alias = "needs-follow-up", alias = "uncertain")]
    NeedsFollowUp,
    #[serde(alias = "not-applicable")]
    NotApplicable,
}

/// Classification of one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub status: FindingStatus,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    /// The text alone was not enough; look at the images
    #[serde(default)]
    pub needs_visual: bool,
}

impl Finding {
    /// Safe fallback: always "needs follow-up", never a pass
    pub fn conservative(reason: &FallbackReason) -> Self {
        let why = match reason {
            FallbackReason::MissingIndex => "no result returned for this item".to_string(),
            FallbackReason::ItemError { message } => format!("unreadable result: {}", message),
            FallbackReason::BatchError { cause } => format!("analysis failed: {}", cause),
        };
        Self {
            status: FindingStatus::NeedsFollowUp,
            rationale: why,
            confidence: None,
            needs_visual: false,
        }
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self {
            status: FindingStatus::NotApplicable,
            rationale: reason.into(),
            confidence: None,
            needs_visual: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentPhase {
    Triage,
    TextAnalysis,
    VisualAnalysis,
    Persist,
    Complete,
}

impl AssessmentPhase {
    /// Checkpoint key suffix for phases that checkpoint
    pub fn checkpoint_name(self) -> Option<&'static str> {
        match self {
            AssessmentPhase::TextAnalysis => Some("text"),
            AssessmentPhase::VisualAnalysis => Some("visual"),
            _ => None,
        }
    }
}

/// Progress event emitted by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentProgress {
    pub phase: AssessmentPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Progress callback; runs inline and must stay cheap
pub type AssessmentProgressFn<'a> = dyn Fn(AssessmentProgress) + Send + Sync + 'a;

/// What gets written to the final store for one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalRecord {
    pub item_id: String,
    /// Terminal classification state
    pub state: ItemState,
    pub finding: Finding,
    /// Set when the finding is a conservative default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentSummary {
    pub total: usize,
    pub triaged_out: usize,
    pub conclusive_from_text: usize,
    pub conclusive_from_visual: usize,
    /// Analysed items with a genuine model answer
    pub resolved: usize,
    /// Analysed items carrying a conservative default
    pub fallback: usize,
    pub batch_errors: usize,
    pub item_errors: usize,
    /// Items whose result came from a checkpoint instead of a new call
    pub resumed: usize,
    pub tokens_used: u64,
}

impl AssessmentSummary {
    pub(crate) fn count_record(&mut self, record: &FinalRecord) {
        self.total += 1;
        match record.state {
            ItemState::TriagedOut => {
                self.triaged_out += 1;
                return;
            }
            ItemState::ConclusiveFromText => self.conclusive_from_text += 1,
            ItemState::ConclusiveFromVisual => self.conclusive_from_visual += 1,
            _ => {}
        }
        match &record.fallback {
            None => self.resolved += 1,
            Some(reason) => {
                self.fallback += 1;
                match reason {
                    FallbackReason::BatchError { .. } => self.batch_errors += 1,
                    FallbackReason::ItemError { .. } => self.item_errors += 1,
                    FallbackReason::MissingIndex => {}
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentReport {
    pub run_id: String,
    pub assessment_id: Option<String>,
    /// One record per input item, in input order
    pub records: Vec<FinalRecord>,
    pub summary: AssessmentSummary,
    /// Calls made in this run only
    pub text: BatchSummary,
    pub visual: BatchSummary,
}

/// A failed assessment: where it stopped and how much is already durable
#[derive(Debug, Error)]
#[error(
    "assessment {run_id} failed after {last_completed_phase:?} \
     ({durably_processed} items checkpointed): {error}"
)]
pub struct AssessmentFailure {
    pub run_id: String,
    pub last_completed_phase: Option<AssessmentPhase>,
    /// Items held in checkpoints at failure time
    pub durably_processed: usize,
    #[source]
    pub error: PipelineError,
}
