//! Error types for the pipeline engine
//!
//! Only step-level failures are Rust errors. Item and batch failures are
//! absorbed into the data model as typed outcomes (`ItemResult::Failed`,
//! `Outcome::ConservativeDefault`) so they stay visible in the final output.

use std::time::Duration;
use thiserror::Error;

/// Fatal error raised by a step or by the machinery around it.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A step needed a Context key that was not there
    #[error("step '{step}' requires context key '{key}'")]
    MissingContextKey { step: String, key: String },

    /// A Context value existed but had the wrong shape
    #[error("context key '{key}' is invalid: {reason}")]
    InvalidContextValue { key: String, reason: String },

    /// Two members of a group would share one metadata namespace
    #[error("duplicate step name '{0}' in group")]
    DuplicateStep(String),

    /// Free-form failure raised inside a step
    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The final artifact could not be written
    #[error("failed to persist results: {0}")]
    Persist(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An item tried to move along an edge the state machine does not have
    #[error("item '{item_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        item_id: String,
        from: String,
        to: String,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Convenience constructor for step failures
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Failure scoped to a single work item. Never aborts sibling items.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ItemError(pub String);

impl From<String> for ItemError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ItemError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Failure of the durable checkpoint backend.
///
/// Corrupt checkpoint *content* is not an error: it is logged and treated as
/// "no checkpoint".
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to lock checkpoint '{key}': {message}")]
    Lock { key: String, message: String },
}

/// Failure of one logical external call after the retry/fallback machine ran.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("token limit exceeded: {0}")]
    TokenLimit(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The HTTP transport hit its own deadline
    #[error("transport timed out: {0}")]
    TransportTimeout(String),

    #[error("call failed: {0}")]
    Failed(String),

    /// Every model in the fallback chain ran out of retries
    #[error("all models exhausted ({models}); last error: {last}")]
    Exhausted { models: String, last: Box<CallError> },

    #[error("no models configured")]
    NoModels,
}

impl CallError {
    /// Whether the retry machine may try the same model again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::RateLimited(_) | CallError::Timeout(_) | CallError::TransportTimeout(_)
        )
    }
}

/// Failure to decode a structured model response.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no JSON {0} found in response")]
    NotFound(&'static str),

    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty response")]
    Empty,
}
