//! Layered runtime configuration.
//!
//! Settings are loaded from, in increasing precedence:
//! 1. compiled-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `AGNW_` (`__` as the section
//!    separator, e.g. `AGNW_CONTROL__TIME_SCALE=600`).
//!
//! ```text
//! AGNW_CONTROL__GAIN_K=0.15
//! AGNW_CONTROL__TICK_PERIOD=500ms
//! AGNW_OPTIMIZER__CANDIDATES=512
//! ```

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::controller::ControlTuning;
use crate::error::LabResult;
use crate::optimizer::OptimizerSettings;

/// `[control]` section: control-loop tuning and timing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// First-order temperature tracking gain per second.
    pub gain_k: f64,
    /// Bound on per-tick temperature noise, degrees Celsius.
    pub noise_bound_c: f64,
    /// Allowed overshoot above the setpoint before the run faults.
    pub safety_margin_c: f64,
    /// Ambient (floor) temperature, degrees Celsius.
    pub ambient_temp_c: f64,
    /// Control-loop tick period.
    #[serde(with = "humantime_serde")]
    pub tick_period: Duration,
    /// Multiplier applied to measured elapsed time, for accelerated
    /// simulation (600 makes one wall-clock second count as ten minutes).
    pub time_scale: f64,
    /// Seed for the temperature-noise RNG.
    pub noise_seed: u64,
    /// Capacity of the supervisor's command mailbox.
    pub command_channel_capacity: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            gain_k: 0.1,
            noise_bound_c: 1.0,
            safety_margin_c: 10.0,
            ambient_temp_c: 25.0,
            tick_period: Duration::from_secs(1),
            time_scale: 1.0,
            noise_seed: 0,
            command_channel_capacity: 64,
        }
    }
}

impl ControlSettings {
    /// The controller tuning slice of these settings.
    pub fn tuning(&self) -> ControlTuning {
        ControlTuning {
            gain_k: self.gain_k,
            noise_bound_c: self.noise_bound_c,
            safety_margin_c: self.safety_margin_c,
            ambient_temp_c: self.ambient_temp_c,
        }
    }
}

/// Top-level settings.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Control-loop tuning and timing.
    pub control: ControlSettings,
    /// Suggestion-engine tunables.
    pub optimizer: OptimizerSettings,
}

impl Settings {
    /// Load settings, layering an optional TOML file and `AGNW_` environment
    /// variables over the defaults.
    pub fn new(config_path: Option<&str>) -> LabResult<Self> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&Settings::default())?);
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("AGNW").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
