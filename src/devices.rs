//! External device abstraction and a simulated rig.
//!
//! The controller never talks to hardware directly; it consumes the
//! [`DeviceBus`] trait, which an integration supplies for the physical rig
//! (heater/temperature controller, stirrer, 4-channel liquid handler, UV-Vis
//! and NIR spectrometers). All calls are fallible: a failed call or a
//! disconnected device must drive the controller into its error state rather
//! than letting it actuate blind.
//!
//! [`SimulatedRig`] is the in-process implementation used by tests and the
//! demo binary. It tracks setpoints and dispensed volumes, synthesizes
//! plausible spectra, and lets tests flip individual devices offline.

use anyhow::Result;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of liquid-handler pump channels.
pub const PUMP_CHANNELS: usize = 4;

/// The devices making up one synthesis rig.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceId {
    /// Heating mantle / temperature controller.
    Heater,
    /// Magnetic stirrer.
    Stirrer,
    /// 4-channel syringe pump bank.
    LiquidHandler,
    /// UV-Vis spectrometer (415-680 nm).
    UvVis,
    /// NIR spectrometer (940-1550 nm).
    Nir,
}

impl DeviceId {
    /// All devices on the rig, in a stable order.
    pub const ALL: [DeviceId; 5] = [
        DeviceId::Heater,
        DeviceId::Stirrer,
        DeviceId::LiquidHandler,
        DeviceId::UvVis,
        DeviceId::Nir,
    ];

    fn idx(self) -> usize {
        match self {
            DeviceId::Heater => 0,
            DeviceId::Stirrer => 1,
            DeviceId::LiquidHandler => 2,
            DeviceId::UvVis => 3,
            DeviceId::Nir => 4,
        }
    }

    /// Human-readable device name.
    pub fn name(self) -> &'static str {
        match self {
            DeviceId::Heater => "heater",
            DeviceId::Stirrer => "stirrer",
            DeviceId::LiquidHandler => "liquid handler",
            DeviceId::UvVis => "UV-Vis spectrometer",
            DeviceId::Nir => "NIR spectrometer",
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Spectrometer selector for [`DeviceBus::read_spectrum`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpectrometerChannel {
    /// Visible-range spectrometer.
    UvVis,
    /// Near-infrared spectrometer.
    Nir,
}

impl SpectrometerChannel {
    fn device(self) -> DeviceId {
        match self {
            SpectrometerChannel::UvVis => DeviceId::UvVis,
            SpectrometerChannel::Nir => DeviceId::Nir,
        }
    }
}

/// Read/write primitives exposed by the rig hardware.
///
/// Implementations wrap whatever transport the real devices use; the core
/// treats every call as fallible with the implementation's own timeout
/// policy.
#[async_trait]
pub trait DeviceBus: Send + Sync {
    /// Command the heater to a new temperature setpoint.
    async fn set_heater_setpoint(&self, celsius: f64) -> Result<()>;

    /// Read the current bath temperature.
    async fn read_temperature(&self) -> Result<f64>;

    /// Command the stirrer to a new speed.
    async fn set_stirring_speed(&self, rpm: f64) -> Result<()>;

    /// Dispense a reagent volume on one pump channel (0-based).
    async fn dispense(&self, channel: usize, volume_ml: f64) -> Result<()>;

    /// Acquire one spectrum as `(wavelength_nm, intensity)` pairs.
    async fn read_spectrum(&self, channel: SpectrometerChannel) -> Result<Vec<(f64, f64)>>;

    /// Whether a device currently reports connected.
    async fn is_connected(&self, device: DeviceId) -> bool;
}

struct RigState {
    heater_setpoint_c: f64,
    bath_temp_c: f64,
    stirring_rpm: f64,
    dispensed_ml: [f64; PUMP_CHANNELS],
    connected: [bool; 5],
    rng: ChaCha8Rng,
}

/// Simulated rig for tests and the demo binary.
///
/// All devices start connected; tests can take individual devices offline
/// with [`SimulatedRig::set_connected`] to exercise fail-safe paths.
pub struct SimulatedRig {
    state: Arc<RwLock<RigState>>,
}

impl SimulatedRig {
    /// Create a rig at the given ambient temperature with a seeded noise
    /// source for reproducible spectra.
    pub fn new(ambient_temp_c: f64, seed: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(RigState {
                heater_setpoint_c: 0.0,
                bath_temp_c: ambient_temp_c,
                stirring_rpm: 0.0,
                dispensed_ml: [0.0; PUMP_CHANNELS],
                connected: [true; 5],
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Flip a device's reported connectivity.
    pub async fn set_connected(&self, device: DeviceId, connected: bool) {
        self.state.write().await.connected[device.idx()] = connected;
    }

    /// Total volume dispensed per channel since creation.
    pub async fn dispensed(&self) -> [f64; PUMP_CHANNELS] {
        self.state.read().await.dispensed_ml
    }

    /// The last commanded heater setpoint.
    pub async fn heater_setpoint(&self) -> f64 {
        self.state.read().await.heater_setpoint_c
    }

    /// The last commanded stirring speed.
    pub async fn stirring_speed(&self) -> f64 {
        self.state.read().await.stirring_rpm
    }

    async fn ensure_connected(&self, device: DeviceId) -> Result<()> {
        if !self.state.read().await.connected[device.idx()] {
            anyhow::bail!("{} not connected", device.name());
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBus for SimulatedRig {
    async fn set_heater_setpoint(&self, celsius: f64) -> Result<()> {
        self.ensure_connected(DeviceId::Heater).await?;
        self.state.write().await.heater_setpoint_c = celsius;
        Ok(())
    }

    async fn read_temperature(&self) -> Result<f64> {
        self.ensure_connected(DeviceId::Heater).await?;
        let mut state = self.state.write().await;
        let jitter = state.rng.gen_range(-0.05..=0.05);
        Ok(state.bath_temp_c + jitter)
    }

    async fn set_stirring_speed(&self, rpm: f64) -> Result<()> {
        self.ensure_connected(DeviceId::Stirrer).await?;
        self.state.write().await.stirring_rpm = rpm;
        Ok(())
    }

    async fn dispense(&self, channel: usize, volume_ml: f64) -> Result<()> {
        self.ensure_connected(DeviceId::LiquidHandler).await?;
        if channel >= PUMP_CHANNELS {
            anyhow::bail!("pump channel {channel} out of range (0..{PUMP_CHANNELS})");
        }
        if volume_ml < 0.0 {
            anyhow::bail!("cannot dispense negative volume {volume_ml} mL");
        }
        self.state.write().await.dispensed_ml[channel] += volume_ml;
        Ok(())
    }

    async fn read_spectrum(&self, channel: SpectrometerChannel) -> Result<Vec<(f64, f64)>> {
        self.ensure_connected(channel.device()).await?;
        let mut state = self.state.write().await;
        let spectrum = match channel {
            SpectrometerChannel::UvVis => {
                // 8-channel visible spectrum with a plasmon peak near 480 nm.
                let wavelengths = [415.0, 445.0, 480.0, 515.0, 555.0, 590.0, 630.0, 680.0];
                wavelengths
                    .iter()
                    .map(|&wl| {
                        let base = 0.45 * (-((wl - 480.0) / 70.0_f64).powi(2)).exp() + 0.05;
                        (wl, base + state.rng.gen_range(-0.01..=0.01))
                    })
                    .collect()
            }
            SpectrometerChannel::Nir => {
                // Transmittance dip at the 1450 nm PVP binding band.
                let wavelengths: [f64; 3] = [940.0, 1450.0, 1550.0];
                wavelengths
                    .iter()
                    .map(|&wl| {
                        let base = if (wl - 1450.0).abs() < 1.0 { 0.72 } else { 0.82 };
                        (wl, base + state.rng.gen_range(-0.01..=0.01))
                    })
                    .collect()
            }
        };
        Ok(spectrum)
    }

    async fn is_connected(&self, device: DeviceId) -> bool {
        self.state.read().await.connected[device.idx()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setpoints_are_tracked() {
        let rig = SimulatedRig::new(25.0, 0);
        rig.set_heater_setpoint(160.0).await.unwrap();
        rig.set_stirring_speed(500.0).await.unwrap();
        assert_eq!(rig.heater_setpoint().await, 160.0);
        assert_eq!(rig.stirring_speed().await, 500.0);
    }

    #[tokio::test]
    async fn test_dispense_accumulates() {
        let rig = SimulatedRig::new(25.0, 0);
        rig.dispense(0, 50.0).await.unwrap();
        rig.dispense(0, 50.0).await.unwrap();
        rig.dispense(3, 1.0).await.unwrap();
        assert_eq!(rig.dispensed().await, [100.0, 0.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_dispense_rejects_bad_channel() {
        let rig = SimulatedRig::new(25.0, 0);
        assert!(rig.dispense(PUMP_CHANNELS, 1.0).await.is_err());
        assert!(rig.dispense(0, -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnected_device_fails_calls() {
        let rig = SimulatedRig::new(25.0, 0);
        rig.set_connected(DeviceId::Heater, false).await;
        assert!(!rig.is_connected(DeviceId::Heater).await);
        assert!(rig.set_heater_setpoint(160.0).await.is_err());
        assert!(rig.read_temperature().await.is_err());
        // Other devices are unaffected.
        assert!(rig.set_stirring_speed(400.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_spectra_have_expected_shape() {
        let rig = SimulatedRig::new(25.0, 7);
        let uvvis = rig.read_spectrum(SpectrometerChannel::UvVis).await.unwrap();
        assert_eq!(uvvis.len(), 8);
        // Peak channel sits at 480 nm.
        let peak = uvvis
            .iter()
            .cloned()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap();
        assert_eq!(peak.0, 480.0);

        let nir = rig.read_spectrum(SpectrometerChannel::Nir).await.unwrap();
        assert_eq!(nir.len(), 3);
    }

    #[tokio::test]
    async fn test_spectra_reproducible_for_seed() {
        let a = SimulatedRig::new(25.0, 42);
        let b = SimulatedRig::new(25.0, 42);
        let sa = a.read_spectrum(SpectrometerChannel::UvVis).await.unwrap();
        let sb = b.read_spectrum(SpectrometerChannel::UvVis).await.unwrap();
        assert_eq!(sa, sb);
    }
}
