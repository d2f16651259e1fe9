//! Fan-out Item Step
//!
//! Derives a work list from the Context, processes items through a bounded
//! worker pool, then merges every outcome back in one place. Workers only
//! read the Context; the merge is the single writer.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;

use super::cancel::CancelFlag;
use super::context::Context;
use super::step::SuspendableStep;
use crate::config::PipelineConfig;
use crate::error::{ItemError, PipelineError};

/// Per-item logic plugged into a [`FanOutStep`]
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    type Item: Send + Sync;
    type Output: Send;

    /// Namespace for logging and for the run report
    fn name(&self) -> &str;

    /// Pure derivation of the work list from the Context
    fn get_items(&self, ctx: &Context) -> Result<Vec<Self::Item>, PipelineError>;

    /// Stable id used in logs and outcomes
    fn item_id(&self, item: &Self::Item) -> String;

    /// `Ok(None)` means the item was skipped on purpose.
    async fn process_item(
        &self,
        item: &Self::Item,
        ctx: &Context,
    ) -> Result<Option<Self::Output>, ItemError>;

    /// Fold all outcomes into the Context.
    ///
    /// Outcomes arrive sorted by submission index.
    fn merge_results(
        &self,
        outcomes: Vec<ItemOutcome<Self::Output>>,
        ctx: &mut Context,
    ) -> Result<(), PipelineError>;
}

/// What happened to one item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult<O> {
    Produced(O),
    /// Intentionally skipped: counted, but carries no result
    Skipped,
    Failed(ItemError),
    /// Never started because the run was cancelled
    Cancelled,
}

impl<O> ItemResult<O> {
    pub fn output(&self) -> Option<&O> {
        match self {
            ItemResult::Produced(o) => Some(o),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome<O> {
    /// Position in the `get_items` list
    pub index: usize,
    pub item_id: String,
    pub result: ItemResult<O>,
}

/// Counts for one fan-out run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub total: usize,
    pub produced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl FanOutReport {
    /// Items that ran, whatever their result
    pub fn processed(&self) -> usize {
        self.produced + self.skipped + self.failed
    }

    fn count<O>(&mut self, result: &ItemResult<O>) {
        match result {
            ItemResult::Produced(_) => self.produced += 1,
            ItemResult::Skipped => self.skipped += 1,
            ItemResult::Failed(_) => self.failed += 1,
            ItemResult::Cancelled => self.cancelled += 1,
        }
    }
}

/// Bounded-concurrency driver for an [`ItemProcessor`]
pub struct FanOutStep<P> {
    processor: P,
    max_concurrency: usize,
    cancel: Option<CancelFlag>,
}

impl<P: ItemProcessor> FanOutStep<P> {
    pub fn new(processor: P, max_concurrency: usize) -> Self {
        Self {
            processor,
            max_concurrency: max_concurrency.max(1),
            cancel: None,
        }
    }

    /// Bound the pool by `fanout_concurrency`
    pub fn from_config(processor: P, config: &PipelineConfig) -> Self {
        Self::new(processor, config.fanout_concurrency)
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Process every item and merge into `ctx`.
    pub async fn execute(&self, ctx: &mut Context) -> Result<FanOutReport, PipelineError> {
        let name = self.processor.name();
        let items = self.processor.get_items(ctx)?;
        let total = items.len();

        tracing::info!(
            step = name,
            run_id = %ctx.run_id,
            items = total,
            concurrency = self.max_concurrency,
            "Fan-out starting"
        );

        let mut outcomes = Vec::with_capacity(total);
        {
            let snapshot: &Context = ctx;
            let processor = &self.processor;
            let cancel = self.cancel.as_ref();

            let work: Vec<_> = items
                .iter()
                .enumerate()
                .map(|(index, item)| async move {
                    let item_id = processor.item_id(item);
                    if cancel.is_some_and(CancelFlag::is_cancelled) {
                        return ItemOutcome {
                            index,
                            item_id,
                            result: ItemResult::Cancelled,
                        };
                    }
                    let attempt = AssertUnwindSafe(processor.process_item(item, snapshot));
                    let result = match attempt.catch_unwind().await {
                        Ok(Ok(Some(output))) => ItemResult::Produced(output),
                        Ok(Ok(None)) => ItemResult::Skipped,
                        Ok(Err(e)) => ItemResult::Failed(e),
                        Err(payload) => ItemResult::Failed(ItemError::from(format!(
                            "item panicked: {}",
                            panic_message(payload.as_ref())
                        ))),
                    };
                    ItemOutcome {
                        index,
                        item_id,
                        result,
                    }
                })
                .collect();

            // Futures stay lazy until the stream polls them
            let mut pending = stream::iter(work).buffer_unordered(self.max_concurrency);

            // Single coordinating loop: completion order is arbitrary here
            while let Some(outcome) = pending.next().await {
                match &outcome.result {
                    ItemResult::Failed(e) => tracing::warn!(
                        step = name,
                        item = %outcome.item_id,
                        error = %e,
                        "Item failed"
                    ),
                    ItemResult::Cancelled => {}
                    _ => tracing::debug!(step = name, item = %outcome.item_id, "Item done"),
                }
                outcomes.push(outcome);
            }
        }

        outcomes.sort_by_key(|o| o.index);

        let mut report = FanOutReport {
            total,
            ..Default::default()
        };
        for outcome in &outcomes {
            report.count(&outcome.result);
        }

        self.processor.merge_results(outcomes, ctx)?;

        tracing::info!(
            step = name,
            produced = report.produced,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "Fan-out complete"
        );
        Ok(report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[async_trait]
impl<P> SuspendableStep for FanOutStep<P>
where
    P: ItemProcessor,
{
    fn name(&self) -> &str {
        self.processor.name()
    }

    async fn process(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        let report = self.execute(ctx).await?;
        ctx.record(self.processor.name(), "report", json!(report));
        Ok(())
    }
}
