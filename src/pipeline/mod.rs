//! Pipeline engine
//!
//! Context, steps and the three ways of composing them: sequential,
//! parallel group and per-item fan-out.

pub mod cancel;
pub mod context;
pub mod fanout;
pub mod parallel;
pub mod sequential;
pub mod step;

pub use cancel::CancelFlag;
pub use context::{Context, StepOutput};
pub use fanout::{FanOutReport, FanOutStep, ItemOutcome, ItemProcessor, ItemResult};
pub use parallel::{ParallelMember, ParallelStepGroup};
pub use sequential::{RunFailure, SequentialPipeline, StepProgress};
pub use step::{BlockingStep, Step, StepMode, SuspendableStep};
