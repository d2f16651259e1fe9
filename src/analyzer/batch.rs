//! Batch Analyzer
//!
//! Packs up to `batch_size` items into one external call, numbering them
//! from 1, and splits the structured answer back into exactly one outcome
//! per item. Anything the model leaves out, or that cannot be decoded,
//! gets the task's conservative default, tagged with why.

use futures::future;
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::call::{CallRequest, ImageInput, ModelClient};
use super::decode::decode_list;
use super::retry::{call_with_fallback, CallTrace};
use crate::config::{PhaseLimits, PipelineConfig, RetryPolicy};
use crate::error::CallError;
use crate::pipeline::CancelFlag;

/// Why an item carries a conservative default instead of a real answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The response had no entry for this item's index
    MissingIndex,
    /// The entry existed but could not be decoded
    ItemError { message: String },
    /// The whole call failed after retries and fallbacks
    BatchError { cause: String },
}

/// Exactly one per analyzed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome<O> {
    Resolved { output: O },
    ConservativeDefault { output: O, reason: FallbackReason },
}

impl<O> Outcome<O> {
    pub fn output(&self) -> &O {
        match self {
            Outcome::Resolved { output } | Outcome::ConservativeDefault { output, .. } => output,
        }
    }

    pub fn into_output(self) -> O {
        match self {
            Outcome::Resolved { output } | Outcome::ConservativeDefault { output, .. } => output,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved { .. })
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            Outcome::Resolved { .. } => None,
            Outcome::ConservativeDefault { reason, .. } => Some(reason),
        }
    }
}

/// What a batched analysis asks and how it falls back.
///
/// Prompt wording lives with the task, not with the analyzer.
pub trait BatchTask: Send + Sync {
    type Item: Send + Sync;
    type Output: DeserializeOwned + Send;

    /// Used in logs
    fn name(&self) -> &str;

    /// Leading instructions; must describe the per-item answer fields
    fn instructions(&self) -> String;

    fn system_prompt(&self) -> Option<String> {
        None
    }

    /// Text describing one item; truncated to the item budget
    fn describe(&self, item: &Self::Item) -> String;

    fn images(&self, _item: &Self::Item) -> Vec<ImageInput> {
        Vec::new()
    }

    /// Safe classification used when the real answer is unknown.
    /// Must never resolve to a definitive pass.
    fn conservative_default(&self, item: &Self::Item, reason: &FallbackReason) -> Self::Output;
}

/// Result of one batch call
#[derive(Debug)]
pub struct BatchResult<O> {
    pub batch: usize,
    /// Position of the batch's first item in the full input
    pub offset: usize,
    pub outcomes: Vec<Outcome<O>>,
    /// Model that answered, if the call succeeded
    pub model: Option<String>,
    pub tokens_used: u32,
    pub trace: CallTrace,
    pub error: Option<CallError>,
}

/// Counts across batches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub resolved: usize,
    /// Every conservative default, whatever the reason
    pub fallback: usize,
    pub missing: usize,
    pub item_errors: usize,
    pub batch_errors: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub tokens_used: u64,
}

impl BatchSummary {
    pub fn count_outcome<O>(&mut self, outcome: &Outcome<O>) {
        self.total += 1;
        match outcome.fallback_reason() {
            None => self.resolved += 1,
            Some(reason) => {
                self.fallback += 1;
                match reason {
                    FallbackReason::MissingIndex => self.missing += 1,
                    FallbackReason::ItemError { .. } => self.item_errors += 1,
                    FallbackReason::BatchError { .. } => self.batch_errors += 1,
                }
            }
        }
    }

    pub fn absorb<O>(&mut self, result: &BatchResult<O>) {
        self.batches += 1;
        if result.error.is_some() {
            self.failed_batches += 1;
        }
        self.tokens_used += u64::from(result.tokens_used);
        for outcome in &result.outcomes {
            self.count_outcome(outcome);
        }
    }
}

/// Outcomes in input order plus counts
#[derive(Debug)]
pub struct BatchRun<O> {
    pub outcomes: Vec<Outcome<O>>,
    pub summary: BatchSummary,
}

/// Keep at most `max` characters, marking the cut
pub fn truncate_chars(text: &str, max: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max) {
        Some((cut, _)) => Cow::Owned(format!("{}...[truncated]", &text[..cut])),
        None => Cow::Borrowed(text),
    }
}

pub struct BatchAnalyzer<T: BatchTask> {
    task: T,
    client: Arc<dyn ModelClient>,
    models: Vec<String>,
    retry: RetryPolicy,
    limits: PhaseLimits,
    max_tokens: u32,
    shared_context_chars: usize,
    item_chars: usize,
    json_mode: bool,
    tokens_used: AtomicU64,
}

impl<T: BatchTask> BatchAnalyzer<T> {
    pub fn new(
        task: T,
        client: Arc<dyn ModelClient>,
        models: Vec<String>,
        limits: PhaseLimits,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            task,
            client,
            models,
            retry: config.retry.clone(),
            limits,
            max_tokens: config.max_tokens,
            shared_context_chars: config.shared_context_chars,
            item_chars: config.item_chars,
            json_mode: true,
            tokens_used: AtomicU64::new(0),
        }
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn limits(&self) -> PhaseLimits {
        self.limits
    }

    /// Tokens reported by successful calls so far
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    fn build_request(&self, items: &[T::Item], shared: &str) -> CallRequest {
        let mut prompt = self.task.instructions();

        if !shared.trim().is_empty() {
            prompt.push_str("\n\nSHARED CONTEXT:\n");
            prompt.push_str(&truncate_chars(shared, self.shared_context_chars));
        }

        prompt.push_str(&format!("\n\nITEMS ({}):\n", items.len()));
        let mut images = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let number = i + 1;
            let description = self.task.describe(item);
            prompt.push_str(&format!(
                "[{}] {}\n",
                number,
                truncate_chars(&description, self.item_chars)
            ));
            for image in self.task.images(item) {
                let label = match &image.label {
                    Some(l) => format!("Item {}: {}", number, l),
                    None => format!("Item {}", number),
                };
                images.push(ImageInput::labelled(label, image.data));
            }
        }

        prompt.push_str(&format!(
            "\nRespond with a JSON object {{\"results\": [...]}} holding exactly one entry \
             per item. Each entry must include \"index\" (the item number, 1 to {}).",
            items.len()
        ));

        CallRequest {
            model: String::new(),
            system: self.task.system_prompt(),
            prompt,
            images,
            json_mode: self.json_mode,
            max_tokens: self.max_tokens,
        }
    }

    /// Split a response into one outcome per item
    fn demultiplex(&self, items: &[T::Item], text: &str) -> Vec<Outcome<T::Output>> {
        let entries = match decode_list(text) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(task = self.task.name(), error = %e, "Undecodable batch response");
                return self.fallback_all(items, &format!("undecodable response: {}", e));
            }
        };

        let mut slots: Vec<Option<Outcome<T::Output>>> = items.iter().map(|_| None).collect();

        for entry in entries {
            let Some(index) = entry_index(&entry) else {
                tracing::debug!(task = self.task.name(), "Dropping response entry without index");
                continue;
            };
            let Some(slot) = index.checked_sub(1).and_then(|i| slots.get_mut(i)) else {
                tracing::debug!(task = self.task.name(), index, "Dropping out-of-range index");
                continue;
            };
            if slot.is_some() {
                tracing::debug!(task = self.task.name(), index, "Ignoring duplicate index");
                continue;
            }
            *slot = Some(match serde_json::from_value::<T::Output>(entry) {
                Ok(output) => Outcome::Resolved { output },
                Err(e) => {
                    let reason = FallbackReason::ItemError {
                        message: e.to_string(),
                    };
                    tracing::warn!(
                        task = self.task.name(),
                        index,
                        error = %e,
                        "Malformed item result"
                    );
                    Outcome::ConservativeDefault {
                        output: self.task.conservative_default(&items[index - 1], &reason),
                        reason,
                    }
                }
            });
        }

        slots
            .into_iter()
            .zip(items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| {
                    let reason = FallbackReason::MissingIndex;
                    Outcome::ConservativeDefault {
                        output: self.task.conservative_default(item, &reason),
                        reason,
                    }
                })
            })
            .collect()
    }

    fn fallback_all(&self, items: &[T::Item], cause: &str) -> Vec<Outcome<T::Output>> {
        items
            .iter()
            .map(|item| {
                let reason = FallbackReason::BatchError {
                    cause: cause.to_string(),
                };
                Outcome::ConservativeDefault {
                    output: self.task.conservative_default(item, &reason),
                    reason,
                }
            })
            .collect()
    }

    /// Analyze one batch with a single external call
    pub async fn analyze_batch(
        &self,
        batch: usize,
        offset: usize,
        items: &[T::Item],
        shared: &str,
    ) -> BatchResult<T::Output> {
        if items.is_empty() {
            return BatchResult {
                batch,
                offset,
                outcomes: Vec::new(),
                model: None,
                tokens_used: 0,
                trace: CallTrace::default(),
                error: None,
            };
        }

        let request = self.build_request(items, shared);
        tracing::debug!(task = self.task.name(), batch, items = items.len(), "Sending batch");

        match call_with_fallback(self.client.as_ref(), &self.models, &self.retry, &request).await {
            Ok(success) => {
                self.tokens_used
                    .fetch_add(u64::from(success.tokens_used), Ordering::Relaxed);
                let outcomes = self.demultiplex(items, &success.text);
                BatchResult {
                    batch,
                    offset,
                    outcomes,
                    model: Some(success.model),
                    tokens_used: success.tokens_used,
                    trace: success.trace,
                    error: None,
                }
            }
            Err(failure) => {
                tracing::warn!(
                    task = self.task.name(),
                    batch,
                    items = items.len(),
                    error = %failure.error,
                    "Batch failed, applying conservative defaults"
                );
                BatchResult {
                    batch,
                    offset,
                    outcomes: self.fallback_all(items, &failure.error.to_string()),
                    model: None,
                    tokens_used: 0,
                    trace: failure.trace,
                    error: Some(failure.error),
                }
            }
        }
    }

    /// Single-item path: a batch of one through the same decoder
    pub async fn analyze_one(&self, item: &T::Item, shared: &str) -> Outcome<T::Output> {
        let result = self
            .analyze_batch(0, 0, std::slice::from_ref(item), shared)
            .await;
        match result.outcomes.into_iter().next() {
            Some(outcome) => outcome,
            None => {
                let reason = FallbackReason::MissingIndex;
                Outcome::ConservativeDefault {
                    output: self.task.conservative_default(item, &reason),
                    reason,
                }
            }
        }
    }

    /// Stream batch results as they complete, at most `max_concurrency` in
    /// flight. Once `cancel` is set no further batches are submitted.
    pub fn run_batches<'a>(
        &'a self,
        items: &'a [T::Item],
        shared: &'a str,
        cancel: Option<&'a CancelFlag>,
    ) -> impl Stream<Item = BatchResult<T::Output>> + 'a {
        let batch_size = self.limits.batch_size;
        stream::iter(items.chunks(batch_size).enumerate())
            .take_while(move |_| future::ready(!cancel.is_some_and(CancelFlag::is_cancelled)))
            .map(move |(batch, chunk)| self.analyze_batch(batch, batch * batch_size, chunk, shared))
            .buffer_unordered(self.limits.max_concurrency)
    }

    /// Analyze everything; outcomes come back in input order
    pub async fn analyze_all(&self, items: &[T::Item], shared: &str) -> BatchRun<T::Output> {
        let mut slots: Vec<Option<Outcome<T::Output>>> = items.iter().map(|_| None).collect();
        let mut summary = BatchSummary::default();

        let mut results = Box::pin(self.run_batches(items, shared, None));
        while let Some(result) = results.next().await {
            summary.absorb(&result);
            for (i, outcome) in result.outcomes.into_iter().enumerate() {
                if let Some(slot) = slots.get_mut(result.offset + i) {
                    *slot = Some(outcome);
                }
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| {
                    let reason = FallbackReason::MissingIndex;
                    Outcome::ConservativeDefault {
                        output: self.task.conservative_default(item, &reason),
                        reason,
                    }
                })
            })
            .collect();

        tracing::info!(
            task = self.task.name(),
            total = summary.total,
            resolved = summary.resolved,
            fallback = summary.fallback,
            failed_batches = summary.failed_batches,
            tokens = summary.tokens_used,
            "Batch analysis complete"
        );

        BatchRun { outcomes, summary }
    }
}

/// 1-based index of a response entry; tolerates numeric strings
fn entry_index(entry: &Value) -> Option<usize> {
    match entry.get("index")? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
