//! Message types for actor-based communication
//!
//! Commands sent to the [`LabSupervisor`](crate::supervisor::LabSupervisor)
//! over its mpsc channel, each carrying a oneshot sender for the reply. This
//! keeps callers non-blocking and gives the supervisor exclusive ownership of
//! the controller state.

use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

use crate::controller::{ControllerState, TelemetryPoint};
use crate::devices::DeviceId;
use crate::error::LabResult;
use crate::history::ExperimentRecord;
use crate::optimizer::OptimizationSuggestion;
use crate::outcome::{ExperimentOutcome, TargetMetric};
use crate::params::ExperimentParameters;

/// Commands understood by the supervisor.
#[derive(Debug)]
pub enum LabCommand {
    /// Stage a validated parameter set for the next run.
    Configure {
        params: ExperimentParameters,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Start the configured run.
    Start {
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Pause the running experiment.
    Pause {
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Resume a paused experiment.
    Resume {
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Abort the current run and return to idle.
    Stop {
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Acknowledge a fault, returning the rig to idle.
    Acknowledge {
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Current controller state snapshot.
    GetStatus {
        response: oneshot::Sender<ControllerState>,
    },

    /// Which rig devices currently report connected.
    ConnectedDevices {
        response: oneshot::Sender<Vec<(DeviceId, bool)>>,
    },

    /// Pair a completed run with its measured outcome and append it to the
    /// history. Valid only when the controller is in `completed`.
    RecordOutcome {
        outcome: ExperimentOutcome,
        response: oneshot::Sender<LabResult<Arc<ExperimentRecord>>>,
    },

    /// Snapshot of the full experiment history, oldest first.
    GetHistory {
        response: oneshot::Sender<Vec<Arc<ExperimentRecord>>>,
    },

    /// Ask the suggestion engine for the next experiment. A newer request
    /// supersedes any fit still in flight; the superseded caller's receiver
    /// is dropped.
    SuggestNext {
        metric: TargetMetric,
        seed: Option<u64>,
        response: oneshot::Sender<LabResult<OptimizationSuggestion>>,
    },

    /// Subscribe to the per-tick telemetry broadcast.
    SubscribeTelemetry {
        response: oneshot::Sender<broadcast::Receiver<TelemetryPoint>>,
    },

    /// Shut the supervisor down.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl LabCommand {
    /// Helper to create a Configure command
    pub fn configure(params: ExperimentParameters) -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Configure { params, response: tx }, rx)
    }

    /// Helper to create a Start command
    pub fn start() -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { response: tx }, rx)
    }

    /// Helper to create a Pause command
    pub fn pause() -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Helper to create a Resume command
    pub fn resume() -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Helper to create a Stop command
    pub fn stop() -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Helper to create an Acknowledge command
    pub fn acknowledge() -> (Self, oneshot::Receiver<LabResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Acknowledge { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<ControllerState>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a ConnectedDevices command
    pub fn connected_devices() -> (Self, oneshot::Receiver<Vec<(DeviceId, bool)>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ConnectedDevices { response: tx }, rx)
    }

    /// Helper to create a RecordOutcome command
    pub fn record_outcome(
        outcome: ExperimentOutcome,
    ) -> (Self, oneshot::Receiver<LabResult<Arc<ExperimentRecord>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RecordOutcome { outcome, response: tx }, rx)
    }

    /// Helper to create a GetHistory command
    pub fn get_history() -> (Self, oneshot::Receiver<Vec<Arc<ExperimentRecord>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetHistory { response: tx }, rx)
    }

    /// Helper to create a SuggestNext command
    pub fn suggest_next(
        metric: TargetMetric,
        seed: Option<u64>,
    ) -> (Self, oneshot::Receiver<LabResult<OptimizationSuggestion>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SuggestNext {
                metric,
                seed,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SubscribeTelemetry command
    pub fn subscribe_telemetry() -> (Self, oneshot::Receiver<broadcast::Receiver<TelemetryPoint>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SubscribeTelemetry { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
