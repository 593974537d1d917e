//! Actor owning the controller, history, and suggestion engine.
//!
//! All mutable lab state lives in a single async task that processes
//! [`LabCommand`]s via message-passing; callers hold only an mpsc sender.
//! The same task drives the control loop from a periodic timer, so command
//! handling and ticking never race.
//!
//! Surrogate fits are CPU-bound and run on a blocking thread. Only one fit
//! is live at a time: a newer `SuggestNext` cancels the previous fit's
//! token, and the superseded caller observes its response channel closing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Settings;
use crate::controller::{ProcessController, TelemetryPoint, TickEvent};
use crate::devices::{DeviceBus, DeviceId};
use crate::error::LabError;
use crate::history::HistoryStore;
use crate::messages::LabCommand;
use crate::optimizer::{self, CancelToken, OptimizerSettings};

const TELEMETRY_CHANNEL_CAPACITY: usize = 256;

/// Actor that manages one synthesis rig and its experiment campaign.
pub struct LabSupervisor {
    controller: ProcessController,
    history: HistoryStore,
    bus: Arc<dyn DeviceBus>,
    optimizer: OptimizerSettings,
    telemetry_tx: broadcast::Sender<TelemetryPoint>,
    tick_period: Duration,
    time_scale: f64,
    active_fit: Option<CancelToken>,
}

impl LabSupervisor {
    /// Create a supervisor over the given device bus.
    pub fn new(bus: Arc<dyn DeviceBus>, settings: &Settings) -> Self {
        let (telemetry_tx, _) = broadcast::channel(TELEMETRY_CHANNEL_CAPACITY);
        Self {
            controller: ProcessController::new(
                Arc::clone(&bus),
                settings.control.tuning(),
                settings.control.noise_seed,
            ),
            history: HistoryStore::new(),
            bus,
            optimizer: settings.optimizer,
            telemetry_tx,
            tick_period: settings.control.tick_period,
            time_scale: settings.control.time_scale,
            active_fit: None,
        }
    }

    /// Shared handle to the experiment history.
    pub fn history(&self) -> HistoryStore {
        self.history.clone()
    }

    /// Runs the actor event loop, processing commands and driving the
    /// control loop until shutdown.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<LabCommand>) {
        info!(
            tick_period = ?self.tick_period,
            time_scale = self.time_scale,
            "lab supervisor started"
        );
        let mut ticker = tokio::time::interval(self.tick_period);
        // A delayed tick contributes its full measured elapsed time on the
        // next pass; no burst catch-up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("all command senders dropped; supervisor exiting");
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick).mul_f64(self.time_scale);
                    last_tick = now;
                    self.tick(elapsed).await;
                }
            }
        }

        if let Some(fit) = self.active_fit.take() {
            fit.cancel();
        }
        // Leave the rig safe on the way out.
        if self.controller.stop().await.is_ok() {
            debug!("active run aborted at shutdown");
        }
        info!("lab supervisor stopped");
    }

    async fn tick(&mut self, elapsed: Duration) {
        match self.controller.tick(elapsed).await {
            Ok(TickEvent::Skipped) => {}
            Ok(TickEvent::Telemetry(point)) => {
                trace!(
                    measured_temp_c = point.measured_temp_c,
                    progress_pct = point.progress_pct,
                    "tick"
                );
                let _ = self.telemetry_tx.send(point);
            }
            Ok(TickEvent::Completed(point)) => {
                let _ = self.telemetry_tx.send(point);
                info!("run complete; awaiting outcome measurement");
            }
            // The controller has already faulted and halted actuation; the
            // fault surfaces to callers through status queries.
            Err(fault) => warn!(%fault, "control tick faulted"),
        }
    }

    /// Handle one command; returns true on shutdown.
    async fn handle_command(&mut self, command: LabCommand) -> bool {
        match command {
            LabCommand::Configure { params, response } => {
                let _ = response.send(self.controller.configure(params));
            }

            LabCommand::Start { response } => {
                let _ = response.send(self.controller.start().await);
            }

            LabCommand::Pause { response } => {
                let _ = response.send(self.controller.pause());
            }

            LabCommand::Resume { response } => {
                let _ = response.send(self.controller.resume());
            }

            LabCommand::Stop { response } => {
                let _ = response.send(self.controller.stop().await);
            }

            LabCommand::Acknowledge { response } => {
                let _ = response.send(self.controller.acknowledge());
            }

            LabCommand::GetStatus { response } => {
                let _ = response.send(self.controller.status());
            }

            LabCommand::ConnectedDevices { response } => {
                let mut devices = Vec::with_capacity(DeviceId::ALL.len());
                for device in DeviceId::ALL {
                    devices.push((device, self.bus.is_connected(device).await));
                }
                let _ = response.send(devices);
            }

            LabCommand::RecordOutcome { outcome, response } => {
                let result = self
                    .controller
                    .close_run()
                    .map(|params| self.history.record(params, outcome));
                if let Ok(record) = &result {
                    info!(
                        id = record.id,
                        aspect_ratio = record.outcome.aspect_ratio(),
                        yield_percent = record.outcome.yield_percent,
                        "experiment recorded"
                    );
                }
                let _ = response.send(result);
            }

            LabCommand::GetHistory { response } => {
                let _ = response.send(self.history.all());
            }

            LabCommand::SuggestNext {
                metric,
                seed,
                response,
            } => {
                // Supersede any fit still in flight.
                if let Some(previous) = self.active_fit.take() {
                    previous.cancel();
                }
                let cancel = CancelToken::new();
                self.active_fit = Some(cancel.clone());

                let snapshot = self.history.all();
                let settings = self.optimizer;
                tokio::task::spawn_blocking(move || {
                    match optimizer::suggest_next(&snapshot, metric, seed, &settings, &cancel) {
                        // Superseded: drop the sender so the caller sees the
                        // channel close instead of a stale suggestion.
                        Ok(None) => drop(response),
                        Ok(Some(suggestion)) => {
                            let _ = response.send(Ok(suggestion));
                        }
                        Err(err) => {
                            let _ = response.send(Err(err));
                        }
                    }
                });
            }

            LabCommand::SubscribeTelemetry { response } => {
                let _ = response.send(self.telemetry_tx.subscribe());
            }

            LabCommand::Shutdown { response } => {
                info!("shutdown requested");
                let _ = response.send(());
                return true;
            }
        }
        false
    }
}

/// Spawn a supervisor task, returning the command sender and join handle.
pub fn spawn(
    bus: Arc<dyn DeviceBus>,
    settings: &Settings,
) -> (mpsc::Sender<LabCommand>, tokio::task::JoinHandle<()>) {
    let supervisor = LabSupervisor::new(bus, settings);
    let (command_tx, command_rx) = mpsc::channel(settings.control.command_channel_capacity);
    let handle = tokio::spawn(supervisor.run(command_rx));
    (command_tx, handle)
}

/// Convenience for callers awaiting a supervisor reply: a closed channel
/// means the request was superseded or the supervisor is gone.
pub fn reply_or_gone<T>(result: Result<T, tokio::sync::oneshot::error::RecvError>) -> Result<T, LabError> {
    result.map_err(|_| LabError::SupervisorGone)
}
