//! Sequential Pipeline
//!
//! Runs steps strictly in order: step N+1 never starts before step N returns.
//! There is no retry here. Steps that talk to the network own their retries.

use async_trait::async_trait;
use thiserror::Error;

use super::context::Context;
use super::step::{Step, SuspendableStep};
use crate::error::PipelineError;

/// Progress hook invoked between steps with `(step_index, total_steps, step_name)`.
///
/// `step_index` is zero-based. The hook runs synchronously on the driver and
/// must not do network I/O.
pub type StepProgress<'a> = dyn Fn(usize, usize, &str) + Send + Sync + 'a;

/// A run aborted by a step error.
///
/// Carries the Context as it was when the failing step returned, so the
/// caller can decide whether to persist partial work.
#[derive(Debug, Error)]
#[error("pipeline '{pipeline}' failed at step '{failed_step}': {error}")]
pub struct RunFailure {
    pub pipeline: String,
    pub failed_step: String,
    /// Name of the last step that returned successfully, if any
    pub last_completed_step: Option<String>,
    #[source]
    pub error: PipelineError,
    pub context: Context,
}

/// Ordered composition of steps
#[derive(Debug)]
pub struct SequentialPipeline {
    name: String,
    steps: Vec<Step>,
}

impl SequentialPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Builder-style append
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    /// Run every step in order against `ctx`.
    ///
    /// The first step error aborts the run and is returned unmodified inside
    /// a [`RunFailure`].
    pub async fn run(
        &self,
        mut ctx: Context,
        progress: Option<&StepProgress<'_>>,
    ) -> Result<Context, RunFailure> {
        let total = self.steps.len();
        tracing::info!(
            pipeline = %self.name,
            run_id = %ctx.run_id,
            steps = total,
            "Starting pipeline"
        );

        let mut last_completed: Option<&str> = None;

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(report) = progress {
                report(index, total, step.name());
            }

            tracing::debug!(
                pipeline = %self.name,
                step = step.name(),
                mode = ?step.mode(),
                "Running step"
            );

            if let Err(error) = step.process(&mut ctx).await {
                tracing::error!(
                    pipeline = %self.name,
                    run_id = %ctx.run_id,
                    step = step.name(),
                    error = %error,
                    "Step failed, aborting pipeline"
                );
                return Err(RunFailure {
                    pipeline: self.name.clone(),
                    failed_step: step.name().to_string(),
                    last_completed_step: last_completed.map(str::to_string),
                    error,
                    context: ctx,
                });
            }

            last_completed = Some(step.name());
        }

        tracing::info!(pipeline = %self.name, run_id = %ctx.run_id, "Pipeline complete");
        Ok(ctx)
    }
}

/// Pipelines nest: a whole pipeline can be one step of an outer pipeline.
#[async_trait]
impl SuspendableStep for SequentialPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        let owned = std::mem::take(ctx);
        match self.run(owned, None).await {
            Ok(done) => {
                *ctx = done;
                Ok(())
            }
            Err(failure) => {
                *ctx = failure.context;
                Err(failure.error)
            }
        }
    }
}
