//! Per-item state machine
//!
//! ```text
//! Unprocessed -> TriagedOut ---------------------------------+
//!             -> NeedsText -> ConclusiveFromText ------------+-> Persisted
//!                          -> NeedsVisual -> ConclusiveFromVisual
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Unprocessed,
    TriagedOut,
    NeedsText,
    ConclusiveFromText,
    NeedsVisual,
    ConclusiveFromVisual,
    Persisted,
}

impl ItemState {
    pub fn can_transition(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Unprocessed, TriagedOut)
                | (Unprocessed, NeedsText)
                | (NeedsText, ConclusiveFromText)
                | (NeedsText, NeedsVisual)
                | (NeedsVisual, ConclusiveFromVisual)
                | (TriagedOut, Persisted)
                | (ConclusiveFromText, Persisted)
                | (ConclusiveFromVisual, Persisted)
        )
    }

    /// Has a final classification (whether or not it is persisted yet)
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::TriagedOut
                | ItemState::ConclusiveFromText
                | ItemState::ConclusiveFromVisual
                | ItemState::Persisted
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Unprocessed => "unprocessed",
            ItemState::TriagedOut => "triaged_out",
            ItemState::NeedsText => "needs_text",
            ItemState::ConclusiveFromText => "conclusive_from_text",
            ItemState::NeedsVisual => "needs_visual",
            ItemState::ConclusiveFromVisual => "conclusive_from_visual",
            ItemState::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// Current state of every item in one run
#[derive(Debug, Clone, Default)]
pub struct ItemLedger {
    states: BTreeMap<String, ItemState>,
}

impl ItemLedger {
    /// Start every id at `Unprocessed`; ids must be unique
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<Self, PipelineError> {
        let mut states = BTreeMap::new();
        for id in ids {
            if states.insert(id.to_string(), ItemState::Unprocessed).is_some() {
                return Err(PipelineError::InvalidContextValue {
                    key: id.to_string(),
                    reason: "duplicate work item id".to_string(),
                });
            }
        }
        Ok(Self { states })
    }

    pub fn state(&self, id: &str) -> Option<ItemState> {
        self.states.get(id).copied()
    }

    pub fn advance(&mut self, id: &str, to: ItemState) -> Result<(), PipelineError> {
        let from = self.state(id).unwrap_or_default();
        if !from.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                item_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.states.insert(id.to_string(), to);
        Ok(())
    }

    pub fn count(&self, state: ItemState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Every item has reached a final classification
    pub fn all_terminal(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }
}
