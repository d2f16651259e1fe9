//! Batch tasks for the text and visual phases

use super::types::{Finding, WorkItem};
use crate::analyzer::{BatchTask, FallbackReason, ImageInput};

const TEXT_INSTRUCTIONS: &str = "You are reviewing a document against a list of compliance checks. \
For each item decide whether the document satisfies it, using only the shared context. \
Answer per item with \"status\" (compliant, non_compliant, needs_follow_up or not_applicable), \
\"rationale\" (one or two sentences), \"confidence\" (0 to 1) and \"needs_visual\" \
(true when layout, signatures, stamps or other visual evidence is required to decide).";

const VISUAL_INSTRUCTIONS: &str = "You are reviewing rendered document pages against \
compliance checks the text alone could not settle. The images for each item are labelled \
with its number. \
Answer per item with \"status\" (compliant, non_compliant, needs_follow_up or not_applicable), \
\"rationale\" and \"confidence\" (0 to 1).";

/// Which phase a [`FindingTask`] serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Visual,
}

#[derive(Debug, Clone)]
pub struct FindingTask {
    modality: Modality,
    instructions: String,
    system_prompt: Option<String>,
}

impl FindingTask {
    pub fn text() -> Self {
        Self {
            modality: Modality::Text,
            instructions: TEXT_INSTRUCTIONS.to_string(),
            system_prompt: None,
        }
    }

    pub fn visual() -> Self {
        Self {
            modality: Modality::Visual,
            instructions: VISUAL_INSTRUCTIONS.to_string(),
            system_prompt: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }
}

impl BatchTask for FindingTask {
    type Item = WorkItem;
    type Output = Finding;

    fn name(&self) -> &str {
        match self.modality {
            Modality::Text => "text_analysis",
            Modality::Visual => "visual_analysis",
        }
    }

    fn instructions(&self) -> String {
        self.instructions.clone()
    }

    fn system_prompt(&self) -> Option<String> {
        self.system_prompt.clone()
    }

    fn describe(&self, item: &WorkItem) -> String {
        item.description.clone()
    }

    fn images(&self, item: &WorkItem) -> Vec<ImageInput> {
        match self.modality {
            Modality::Text => Vec::new(),
            Modality::Visual => item.images.clone(),
        }
    }

    fn conservative_default(&self, _item: &WorkItem, reason: &FallbackReason) -> Finding {
        Finding::conservative(reason)
    }
}
