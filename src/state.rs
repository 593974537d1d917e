//! Experiment lifecycle state machine.
//!
//! Every lifecycle change in the system goes through
//! [`ExperimentStatus::apply`]; callers never mutate status ad hoc. Any
//! (state, event) pair not present in the transition table fails with
//! [`LabError::InvalidTransition`] and leaves the state unchanged.
//!
//! # Transition Table
//!
//! ```text
//! idle      --start-------> running
//! running   --pause-------> paused
//! paused    --resume------> running
//! running   --complete----> completed   (progress reached 100%)
//! running   --stop--------> idle        (run discarded)
//! paused    --stop--------> idle
//! completed --stop--------> idle        (after outcome recorded or discarded)
//! any       --fault-------> error
//! error     --acknowledge-> idle
//! ```
//!
//! `error` is terminal with respect to everything except `acknowledge`; in
//! particular `start` and `stop` are rejected until the fault has been
//! acknowledged.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LabError, LabResult};

/// Lifecycle state of the single physical rig.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// No experiment active; parameters may be configured.
    Idle,
    /// An experiment is actively running (heating, stirring, progressing).
    Running,
    /// Run suspended; controller state preserved, progress frozen.
    Paused,
    /// Progress reached 100%; waiting for an outcome to be recorded.
    Completed,
    /// A safety or device fault occurred; requires explicit acknowledgment.
    Error,
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExperimentStatus::Idle => "idle",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Events that drive the lifecycle state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Begin a configured run.
    Start,
    /// Suspend a running experiment.
    Pause,
    /// Resume a paused experiment.
    Resume,
    /// Progress reached 100%.
    Complete,
    /// Abort the current run (or close out a completed one).
    Stop,
    /// A safety or device fault occurred.
    Fault,
    /// Operator acknowledged a fault.
    Acknowledge,
}

impl LifecycleEvent {
    /// The event as a verb, for error messages.
    pub fn verb(self) -> &'static str {
        match self {
            LifecycleEvent::Start => "start",
            LifecycleEvent::Pause => "pause",
            LifecycleEvent::Resume => "resume",
            LifecycleEvent::Complete => "complete",
            LifecycleEvent::Stop => "stop",
            LifecycleEvent::Fault => "fault",
            LifecycleEvent::Acknowledge => "acknowledge",
        }
    }
}

impl ExperimentStatus {
    /// Apply a lifecycle event, returning the next state.
    ///
    /// Fails with [`LabError::InvalidTransition`] for any pair not in the
    /// transition table; the caller's state is left untouched in that case.
    pub fn apply(self, event: LifecycleEvent) -> LabResult<ExperimentStatus> {
        use ExperimentStatus::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Idle, Start) => Running,
            (Running, Pause) => Paused,
            (Paused, Resume) => Running,
            (Running, Complete) => Completed,
            // Stopping from idle is a harmless no-op.
            (Idle | Running | Paused | Completed, Stop) => Idle,
            (_, Fault) => Error,
            (Error, Acknowledge) => Idle,
            (from, event) => {
                return Err(LabError::InvalidTransition {
                    from,
                    action: event.verb(),
                })
            }
        };
        Ok(next)
    }
}
