//! Rotation engine
//!
//! [`Orchestrator`] drives one rule through the rotation state machine,
//! [`run`] holds the records it produces and [`retry`] the bounded retry
//! discipline applied to every external call.

mod orchestrator;
mod retry;
mod run;

pub use orchestrator::{Orchestrator, RotationSettings};
pub use retry::{retry_transient, Attempted, RetryPolicy};
pub use run::{
    FailureReason, RecoveryValue, RotationRun, RotationState, RotationStep, RunStatus, StepName,
    StepOutcome, TriggerSource,
};
