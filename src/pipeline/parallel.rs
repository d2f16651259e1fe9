//! Parallel Step Group
//!
//! Members run concurrently over one Context snapshot. Each member returns a
//! typed [`StepOutput`] that is installed under the member's own name, so
//! writes are disjoint by construction and no lock is needed.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;

use super::context::{Context, StepOutput};
use super::step::SuspendableStep;
use crate::error::PipelineError;

/// A member of a parallel group. It reads the shared snapshot and produces
/// its own namespace.
#[async_trait]
pub trait ParallelMember: Send + Sync {
    fn name(&self) -> &str;

    async fn produce(&self, ctx: &Context) -> Result<StepOutput, PipelineError>;
}

/// Independent steps run concurrently against one Context
pub struct ParallelStepGroup {
    name: String,
    members: Vec<Box<dyn ParallelMember>>,
}

impl std::fmt::Debug for ParallelStepGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStepGroup")
            .field("name", &self.name)
            .field("members", &self.member_names())
            .finish()
    }
}

impl ParallelStepGroup {
    /// Build a group, rejecting members that would share a namespace.
    pub fn new(
        name: impl Into<String>,
        members: Vec<Box<dyn ParallelMember>>,
    ) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.name().to_string()) {
                return Err(PipelineError::DuplicateStep(member.name().to_string()));
            }
        }
        Ok(Self {
            name: name.into(),
            members,
        })
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }

    /// Run all members, wait for every one of them, then install outputs.
    ///
    /// If any member fails, the others still run to completion and the first
    /// error in declaration order is returned. Nothing is installed in that
    /// case.
    pub async fn run(&self, mut ctx: Context) -> Result<Context, PipelineError> {
        self.apply(&mut ctx).await?;
        Ok(ctx)
    }

    async fn apply(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        let results = {
            let snapshot: &Context = ctx;
            join_all(self.members.iter().map(|m| m.produce(snapshot))).await
        };

        let mut outputs = Vec::with_capacity(results.len());
        let mut first_error = None;

        for (member, result) in self.members.iter().zip(results) {
            match result {
                Ok(output) => outputs.push((member.name(), output)),
                Err(e) => {
                    tracing::warn!(
                        group = %self.name,
                        step = member.name(),
                        error = %e,
                        "Parallel member failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        for (name, output) in outputs {
            ctx.install_output(name, output);
        }

        tracing::debug!(
            group = %self.name,
            members = self.members.len(),
            "Parallel group complete"
        );
        Ok(())
    }
}

#[async_trait]
impl SuspendableStep for ParallelStepGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut Context) -> Result<(), PipelineError> {
        self.apply(ctx).await
    }
}
