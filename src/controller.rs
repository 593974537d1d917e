//! Closed-loop process controller for one synthesis rig.
//!
//! The controller owns the physical trajectory of the active experiment:
//! it dispenses reagents and pushes setpoints at start, tracks the bath
//! temperature toward the setpoint with a bounded first-order law, and
//! advances a monotone reaction-progress estimate from elapsed time.
//!
//! # Control law
//!
//! Per tick of elapsed time `dt`:
//!
//! ```text
//! temp += min(k * dt, 1) * (setpoint - temp) + noise    noise ~ U[-b, +b]
//! ```
//!
//! `k` (the actuator responsiveness gain) and `b` (the sensor/process noise
//! bound) come from [`ControlTuning`]; noise is drawn from a seeded RNG so a
//! given seed reproduces a run exactly. The temperature is floored at
//! ambient. If it ever exceeds `setpoint + safety_margin` the controller
//! halts actuation and faults with `SafetyViolation`.
//!
//! # Fail-safe behavior
//!
//! Device failures and safety violations discovered during a tick halt
//! heating and stirring (best effort) *before* the error is surfaced, and
//! leave the rig in the `error` state. Ticks in any state other than
//! `running` are no-ops.

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::devices::{DeviceBus, DeviceId};
use crate::error::{LabError, LabResult};
use crate::params::ExperimentParameters;
use crate::state::{ExperimentStatus, LifecycleEvent};

/// Control-loop constants. All of these are configuration, not literals; see
/// the `[control]` section of the settings file.
#[derive(Clone, Copy, Debug)]
pub struct ControlTuning {
    /// First-order tracking gain per second, in (0, 1].
    pub gain_k: f64,
    /// Bound on the per-tick temperature noise, degrees Celsius.
    pub noise_bound_c: f64,
    /// Allowed overshoot above the setpoint before the run faults.
    pub safety_margin_c: f64,
    /// Ambient (floor) temperature, degrees Celsius.
    pub ambient_temp_c: f64,
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            gain_k: 0.1,
            noise_bound_c: 1.0,
            safety_margin_c: 10.0,
            ambient_temp_c: 25.0,
        }
    }
}

/// Live view of the rig, owned exclusively by the controller and handed out
/// by value from [`ProcessController::status`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Lifecycle state.
    pub status: ExperimentStatus,
    /// Current measured bath temperature, degrees Celsius.
    pub measured_temp_c: f64,
    /// Active temperature setpoint, degrees Celsius.
    pub target_temp_c: f64,
    /// Current stirring speed, RPM.
    pub stirring_rpm: f64,
    /// Reaction progress, percent in [0, 100]. Monotone while running.
    pub progress_pct: f64,
}

/// One telemetry sample, emitted per tick while running.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Measured bath temperature, degrees Celsius.
    pub measured_temp_c: f64,
    /// Temperature setpoint, degrees Celsius.
    pub setpoint_c: f64,
    /// Stirring speed, RPM.
    pub stirring_rpm: f64,
    /// Reaction progress, percent.
    pub progress_pct: f64,
}

/// What a tick did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickEvent {
    /// Not running; nothing happened.
    Skipped,
    /// Normal control-loop step.
    Telemetry(TelemetryPoint),
    /// Progress reached 100% on this tick; the run is complete and an
    /// outcome measurement should be submitted.
    Completed(TelemetryPoint),
}

/// Closed-loop controller for a single rig.
pub struct ProcessController {
    bus: Arc<dyn DeviceBus>,
    tuning: ControlTuning,
    noise: ChaCha8Rng,
    params: Option<ExperimentParameters>,
    state: ControllerState,
    elapsed: Duration,
    start_temp_c: f64,
    last_fault: Option<String>,
}

impl ProcessController {
    /// Create an idle controller for the given device bus.
    pub fn new(bus: Arc<dyn DeviceBus>, tuning: ControlTuning, noise_seed: u64) -> Self {
        Self {
            bus,
            state: ControllerState {
                status: ExperimentStatus::Idle,
                measured_temp_c: tuning.ambient_temp_c,
                target_temp_c: 0.0,
                stirring_rpm: 0.0,
                progress_pct: 0.0,
            },
            tuning,
            noise: ChaCha8Rng::seed_from_u64(noise_seed),
            params: None,
            elapsed: Duration::ZERO,
            start_temp_c: tuning.ambient_temp_c,
            last_fault: None,
        }
    }

    /// Current controller state, by value.
    pub fn status(&self) -> ControllerState {
        self.state
    }

    /// The parameter set of the configured (or active) run, if any.
    pub fn active_params(&self) -> Option<ExperimentParameters> {
        self.params
    }

    /// Description of the most recent fault, if the rig is in `error`.
    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    /// Temperature recorded when the current run started.
    pub fn start_temp_c(&self) -> f64 {
        self.start_temp_c
    }

    /// Validate and stage parameters for the next run.
    ///
    /// Rejected with `InvalidTransition` while a run is active (running or
    /// paused), and with `InvalidParameter` when any field is out of bounds;
    /// in both cases nothing is applied.
    pub fn configure(&mut self, params: ExperimentParameters) -> LabResult<()> {
        match self.state.status {
            ExperimentStatus::Running | ExperimentStatus::Paused => {
                return Err(LabError::InvalidTransition {
                    from: self.state.status,
                    action: "configure",
                })
            }
            _ => {}
        }
        params.validate()?;
        self.state.target_temp_c = params.temperature_c;
        self.params = Some(params);
        debug!(?params, "parameters configured");
        Ok(())
    }

    /// Begin the configured run.
    ///
    /// Dispenses the four reagents, pushes heater and stirrer setpoints,
    /// records the start temperature, resets progress to zero, and enters
    /// `running`. Device failures fault the rig (fail-safe) instead of
    /// leaving it half-actuated.
    pub async fn start(&mut self) -> LabResult<()> {
        let next = self.state.status.apply(LifecycleEvent::Start)?;
        let params = self.params.ok_or(LabError::InvalidTransition {
            from: self.state.status,
            action: "start an unconfigured run",
        })?;

        // Preflight connectivity before touching any actuator.
        for device in [DeviceId::Heater, DeviceId::Stirrer, DeviceId::LiquidHandler] {
            if !self.bus.is_connected(device).await {
                return Err(self.fault_device(device.name()).await);
            }
        }

        let start_temp = match self.bus.read_temperature().await {
            Ok(t) => t,
            Err(cause) => return Err(self.fault_device(&format!("heater ({cause})")).await),
        };

        let volumes = [
            params.eg_volume_ml,
            params.agno3_volume_ml,
            params.pvp_volume_ml,
            params.nacl_volume_ml,
        ];
        for (channel, volume) in volumes.iter().enumerate() {
            if let Err(cause) = self.bus.dispense(channel, *volume).await {
                return Err(self.fault_device(&format!("liquid handler ({cause})")).await);
            }
        }
        if let Err(cause) = self.bus.set_heater_setpoint(params.temperature_c).await {
            return Err(self.fault_device(&format!("heater ({cause})")).await);
        }
        if let Err(cause) = self.bus.set_stirring_speed(params.stirring_rpm).await {
            return Err(self.fault_device(&format!("stirrer ({cause})")).await);
        }

        self.start_temp_c = start_temp;
        self.state.measured_temp_c = start_temp;
        self.state.target_temp_c = params.temperature_c;
        self.state.stirring_rpm = params.stirring_rpm;
        self.state.progress_pct = 0.0;
        self.elapsed = Duration::ZERO;
        self.state.status = next;
        info!(
            start_temp_c = start_temp,
            setpoint_c = params.temperature_c,
            stirring_rpm = params.stirring_rpm,
            duration_min = params.reaction_time_min,
            "experiment started"
        );
        Ok(())
    }

    /// Suspend the running experiment, preserving all state.
    pub fn pause(&mut self) -> LabResult<()> {
        self.state.status = self.state.status.apply(LifecycleEvent::Pause)?;
        info!("experiment paused");
        Ok(())
    }

    /// Resume a paused experiment.
    pub fn resume(&mut self) -> LabResult<()> {
        self.state.status = self.state.status.apply(LifecycleEvent::Resume)?;
        info!("experiment resumed");
        Ok(())
    }

    /// Abort the current run (or close out a completed one) and return to
    /// `idle`. Progress is discarded; no record is produced.
    pub async fn stop(&mut self) -> LabResult<()> {
        let next = self.state.status.apply(LifecycleEvent::Stop)?;
        self.halt_actuation().await;
        self.state.status = next;
        self.state.progress_pct = 0.0;
        self.state.stirring_rpm = 0.0;
        self.elapsed = Duration::ZERO;
        info!("experiment stopped; run discarded");
        Ok(())
    }

    /// Acknowledge a fault, returning the rig to `idle`.
    pub fn acknowledge(&mut self) -> LabResult<()> {
        self.state.status = self.state.status.apply(LifecycleEvent::Acknowledge)?;
        info!(fault = self.last_fault.as_deref(), "fault acknowledged");
        self.last_fault = None;
        self.state.progress_pct = 0.0;
        self.state.stirring_rpm = 0.0;
        self.elapsed = Duration::ZERO;
        Ok(())
    }

    /// Close out a completed run, returning its parameters so the caller can
    /// pair them with the measured outcome. Valid only from `completed`.
    pub fn close_run(&mut self) -> LabResult<ExperimentParameters> {
        if self.state.status != ExperimentStatus::Completed {
            return Err(LabError::InvalidTransition {
                from: self.state.status,
                action: "record an outcome",
            });
        }
        let params = self.params.ok_or(LabError::InvalidTransition {
            from: self.state.status,
            action: "record an outcome for an unconfigured run",
        })?;
        self.state.status = self.state.status.apply(LifecycleEvent::Stop)?;
        self.state.progress_pct = 0.0;
        self.state.stirring_rpm = 0.0;
        self.elapsed = Duration::ZERO;
        Ok(params)
    }

    /// Advance the control loop by `elapsed` wall-clock (or simulated) time.
    ///
    /// No-op unless `running`. Progress never decreases and is capped at
    /// 100; reaching 100 transitions to `completed` and halts actuation.
    /// Device or safety failures halt actuation and fault the rig.
    pub async fn tick(&mut self, elapsed: Duration) -> LabResult<TickEvent> {
        if self.state.status != ExperimentStatus::Running {
            return Ok(TickEvent::Skipped);
        }
        let Some(params) = self.params else {
            return Ok(TickEvent::Skipped);
        };

        for device in [DeviceId::Heater, DeviceId::Stirrer] {
            if !self.bus.is_connected(device).await {
                return Err(self.fault_device(device.name()).await);
            }
        }

        let dt = elapsed.as_secs_f64();
        let alpha = (self.tuning.gain_k * dt).min(1.0);
        let noise = if self.tuning.noise_bound_c > 0.0 {
            self.noise
                .gen_range(-self.tuning.noise_bound_c..=self.tuning.noise_bound_c)
        } else {
            0.0
        };
        let mut temp =
            self.state.measured_temp_c + alpha * (params.temperature_c - self.state.measured_temp_c) + noise;
        temp = temp.max(self.tuning.ambient_temp_c);

        let limit = params.temperature_c + self.tuning.safety_margin_c;
        if temp > limit {
            self.state.measured_temp_c = temp;
            let fault = LabError::SafetyViolation {
                measured_c: temp,
                limit_c: limit,
            };
            self.enter_error(fault.to_string()).await;
            return Err(fault);
        }
        self.state.measured_temp_c = temp;

        self.elapsed += elapsed;
        let fraction = self.elapsed.as_secs_f64() / params.duration_secs();
        let progress = (fraction * 100.0).min(100.0);
        // Monotone by construction; the max guards against a zero-length tick.
        self.state.progress_pct = self.state.progress_pct.max(progress);

        let point = TelemetryPoint {
            timestamp: Utc::now(),
            measured_temp_c: self.state.measured_temp_c,
            setpoint_c: self.state.target_temp_c,
            stirring_rpm: self.state.stirring_rpm,
            progress_pct: self.state.progress_pct,
        };

        if self.state.progress_pct >= 100.0 {
            self.state.status = self.state.status.apply(LifecycleEvent::Complete)?;
            self.halt_actuation().await;
            info!("reaction complete; ready for outcome measurement");
            return Ok(TickEvent::Completed(point));
        }
        Ok(TickEvent::Telemetry(point))
    }

    /// Drive actuators to safe values, best effort. Errors are logged, not
    /// propagated; this runs on paths that are already failing.
    async fn halt_actuation(&mut self) {
        if let Err(cause) = self.bus.set_heater_setpoint(0.0).await {
            warn!(%cause, "failed to shut heater down while halting");
        }
        if let Err(cause) = self.bus.set_stirring_speed(0.0).await {
            warn!(%cause, "failed to stop stirrer while halting");
        }
    }

    async fn enter_error(&mut self, description: String) {
        error!(fault = %description, "rig fault; halting actuation");
        self.halt_actuation().await;
        // Fault is accepted from every state.
        if let Ok(next) = self.state.status.apply(LifecycleEvent::Fault) {
            self.state.status = next;
        }
        self.last_fault = Some(description);
    }

    async fn fault_device(&mut self, device: &str) -> LabError {
        let fault = LabError::DeviceUnavailable {
            device: device.to_string(),
        };
        self.enter_error(fault.to_string()).await;
        fault
    }

    #[cfg(test)]
    pub(crate) fn inject_measured_temp(&mut self, celsius: f64) {
        self.state.measured_temp_c = celsius;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::SimulatedRig;

    fn quiet_tuning() -> ControlTuning {
        ControlTuning {
            noise_bound_c: 0.0,
            ..ControlTuning::default()
        }
    }

    fn controller_with_rig(tuning: ControlTuning) -> (ProcessController, Arc<SimulatedRig>) {
        let rig = Arc::new(SimulatedRig::new(25.0, 0));
        let controller = ProcessController::new(rig.clone(), tuning, 0);
        (controller, rig)
    }

    fn one_minute_params() -> ExperimentParameters {
        ExperimentParameters {
            reaction_time_min: 1.0,
            ..ExperimentParameters::default()
        }
    }

    #[tokio::test]
    async fn test_configure_then_start_resets_progress() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(ExperimentParameters::default()).unwrap();
        c.start().await.unwrap();
        let s = c.status();
        assert_eq!(s.status, ExperimentStatus::Running);
        assert_eq!(s.progress_pct, 0.0);
        assert_eq!(s.target_temp_c, 160.0);
        assert_eq!(s.stirring_rpm, 500.0);
    }

    #[tokio::test]
    async fn test_configure_out_of_bounds_leaves_state_unchanged() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        let before = c.status();
        let bad = ExperimentParameters {
            temperature_c: 200.0,
            ..ExperimentParameters::default()
        };
        assert!(matches!(
            c.configure(bad).unwrap_err(),
            LabError::InvalidParameter { .. }
        ));
        assert_eq!(c.status(), before);
        assert!(c.active_params().is_none());
    }

    #[tokio::test]
    async fn test_configure_rejected_while_running() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(ExperimentParameters::default()).unwrap();
        c.start().await.unwrap();
        let err = c.configure(ExperimentParameters::default()).unwrap_err();
        assert!(matches!(
            err,
            LabError::InvalidTransition {
                action: "configure",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_start_unconfigured_fails() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        assert!(c.start().await.is_err());
        assert_eq!(c.status().status, ExperimentStatus::Idle);
    }

    #[tokio::test]
    async fn test_second_start_fails_not_queues() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(ExperimentParameters::default()).unwrap();
        c.start().await.unwrap();
        assert!(matches!(
            c.start().await.unwrap_err(),
            LabError::InvalidTransition { action: "start", .. }
        ));
        assert_eq!(c.status().status, ExperimentStatus::Running);
    }

    #[tokio::test]
    async fn test_start_dispenses_recipe() {
        let (mut c, rig) = controller_with_rig(quiet_tuning());
        c.configure(ExperimentParameters::default()).unwrap();
        c.start().await.unwrap();
        assert_eq!(rig.dispensed().await, [100.0, 5.0, 10.0, 1.0]);
        assert_eq!(rig.heater_setpoint().await, 160.0);
        assert_eq!(rig.stirring_speed().await, 500.0);
    }

    #[tokio::test]
    async fn test_progress_is_monotone_and_completes_on_time() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();

        let mut last = 0.0;
        for i in 0..60 {
            let event = c.tick(Duration::from_secs(1)).await.unwrap();
            let progress = c.status().progress_pct;
            assert!(progress >= last, "progress decreased at tick {i}");
            last = progress;
            if i < 59 {
                assert!(matches!(event, TickEvent::Telemetry(_)));
            } else {
                assert!(matches!(event, TickEvent::Completed(_)));
            }
        }
        assert_eq!(c.status().progress_pct, 100.0);
        assert_eq!(c.status().status, ExperimentStatus::Completed);
    }

    #[tokio::test]
    async fn test_temperature_approaches_setpoint() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        for _ in 0..59 {
            c.tick(Duration::from_secs(1)).await.unwrap();
        }
        let temp = c.status().measured_temp_c;
        assert!((temp - 160.0).abs() < 1.0, "temp {temp} far from setpoint");
    }

    #[tokio::test]
    async fn test_tick_tolerates_irregular_periods() {
        // Ticks driven from a clock, not an assumed fixed period: one big
        // 30s tick plus thirty 1s ticks completes a 1-minute run.
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        c.tick(Duration::from_secs(30)).await.unwrap();
        assert!((c.status().progress_pct - 50.0).abs() < 1e-9);
        for _ in 0..30 {
            c.tick(Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(c.status().status, ExperimentStatus::Completed);
    }

    #[tokio::test]
    async fn test_safety_violation_faults_and_halts() {
        let (mut c, rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        c.inject_measured_temp(200.0); // way past 160 + 10 margin
        let err = c.tick(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LabError::SafetyViolation { .. }));
        assert_eq!(c.status().status, ExperimentStatus::Error);
        // Fail-safe: actuators driven to zero.
        assert_eq!(rig.heater_setpoint().await, 0.0);
        assert_eq!(rig.stirring_speed().await, 0.0);

        // Subsequent ticks are no-ops until acknowledged.
        assert_eq!(
            c.tick(Duration::from_secs(1)).await.unwrap(),
            TickEvent::Skipped
        );
        c.acknowledge().unwrap();
        assert_eq!(c.status().status, ExperimentStatus::Idle);
    }

    #[tokio::test]
    async fn test_device_loss_during_run_faults() {
        let (mut c, rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        rig.set_connected(DeviceId::Stirrer, false).await;
        let err = c.tick(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LabError::DeviceUnavailable { .. }));
        assert_eq!(c.status().status, ExperimentStatus::Error);
        assert!(c.last_fault().is_some());
    }

    #[tokio::test]
    async fn test_stop_discards_run() {
        let (mut c, rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        c.tick(Duration::from_secs(10)).await.unwrap();
        c.stop().await.unwrap();
        let s = c.status();
        assert_eq!(s.status, ExperimentStatus::Idle);
        assert_eq!(s.progress_pct, 0.0);
        assert_eq!(rig.heater_setpoint().await, 0.0);
    }

    #[tokio::test]
    async fn test_pause_freezes_progress() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        c.tick(Duration::from_secs(6)).await.unwrap();
        let frozen = c.status().progress_pct;
        c.pause().unwrap();
        assert_eq!(
            c.tick(Duration::from_secs(30)).await.unwrap(),
            TickEvent::Skipped
        );
        assert_eq!(c.status().progress_pct, frozen);
        c.resume().unwrap();
        c.tick(Duration::from_secs(6)).await.unwrap();
        assert!(c.status().progress_pct > frozen);
    }

    #[tokio::test]
    async fn test_close_run_returns_params_once() {
        let (mut c, _rig) = controller_with_rig(quiet_tuning());
        c.configure(one_minute_params()).unwrap();
        c.start().await.unwrap();
        c.tick(Duration::from_secs(60)).await.unwrap();
        assert_eq!(c.status().status, ExperimentStatus::Completed);
        let params = c.close_run().unwrap();
        assert_eq!(params.reaction_time_min, 1.0);
        assert_eq!(c.status().status, ExperimentStatus::Idle);
        // A second close has no run to pair with.
        assert!(c.close_run().is_err());
    }

    #[tokio::test]
    async fn test_noise_is_reproducible_for_seed() {
        let tuning = ControlTuning::default(); // noise on
        let rig_a = Arc::new(SimulatedRig::new(25.0, 1));
        let rig_b = Arc::new(SimulatedRig::new(25.0, 1));
        let mut a = ProcessController::new(rig_a, tuning, 99);
        let mut b = ProcessController::new(rig_b, tuning, 99);
        for c in [&mut a, &mut b] {
            c.configure(one_minute_params()).unwrap();
            c.start().await.unwrap();
        }
        for _ in 0..20 {
            a.tick(Duration::from_secs(1)).await.unwrap();
            b.tick(Duration::from_secs(1)).await.unwrap();
            assert_eq!(a.status().measured_temp_c, b.status().measured_temp_c);
        }
    }
}
