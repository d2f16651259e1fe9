//! Step abstraction
//!
//! A step is either blocking (plain local computation) or suspendable (awaits
//! an external call). The two are kept as a tagged union so the pipeline
//! driver branches once per step.

use async_trait::async_trait;

use super::context::Context;
use crate::error::PipelineError;

/// Scheduling mode of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Blocking,
    Suspendable,
}

/// Synchronous step: parsing, filtering, merging
pub trait BlockingStep: Send + Sync {
    /// Stable name, used for logging and as the metadata namespace
    fn name(&self) -> &str;

    fn process(&self, ctx: &mut Context) -> Result<(), PipelineError>;
}

/// Step that suspends around external calls
#[async_trait]
pub trait SuspendableStep: Send + Sync {
    /// Stable name, used for logging and as the metadata namespace
    fn name(&self) -> &str;

    async fn process(&self, ctx: &mut Context) -> Result<(), PipelineError>;
}

/// A step of either mode
pub enum Step {
    Blocking(Box<dyn BlockingStep>),
    Suspendable(Box<dyn SuspendableStep>),
}

impl Step {
    pub fn blocking(step: impl BlockingStep + 'static) -> Self {
        Step::Blocking(Box::new(step))
    }

    pub fn suspendable(step: impl SuspendableStep + 'static) -> Self {
        Step::Suspendable(Box::new(step))
    }

    /// Wrap a closure as a blocking step
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Context) -> Result<(), PipelineError> + Send + Sync + 'static,
    {
        Step::Blocking(Box::new(FnStep {
            name: name.into(),
            f,
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Step::Blocking(s) => s.name(),
            Step::Suspendable(s) => s.name(),
        }
    }

    pub fn mode(&self) -> StepMode {
        match self {
            Step::Blocking(_) => StepMode::Blocking,
            Step::Suspendable(_) => StepMode::Suspendable,
        }
    }

    /// Run the step against `ctx`
    pub async fn process(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        match self {
            Step::Blocking(s) => s.process(ctx),
            Step::Suspendable(s) => s.process(ctx).await,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("mode", &self.mode())
            .finish()
    }
}

/// Closure-backed blocking step
struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> BlockingStep for FnStep<F>
where
    F: Fn(&mut Context) -> Result<(), PipelineError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        (self.f)(ctx)
    }
}
