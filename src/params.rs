//! Experiment parameters and the bounded synthesis design space.
//!
//! [`ExperimentParameters`] is the immutable value object describing one
//! polyol synthesis run: four reagent volumes, the temperature setpoint,
//! stirring speed, and reaction duration. Values outside their declared
//! bounds are rejected at the boundary via [`ExperimentParameters::validate`];
//! nothing is clamped silently.
//!
//! The optimizer works in a normalized unit cube. [`DESIGN_RANGES`] gives the
//! finite range of each dimension used for that normalization and for
//! candidate sampling; these are narrower than the validation bounds for the
//! open-ended fields (volumes, duration), so every sampled candidate also
//! passes validation.

use serde::{Deserialize, Serialize};

use crate::error::{LabError, LabResult};

/// Number of continuous parameter dimensions.
pub const PARAM_DIM: usize = 7;

/// Declared temperature bound, degrees Celsius.
pub const TEMPERATURE_RANGE_C: (f64, f64) = (140.0, 180.0);
/// Declared stirring bound, RPM.
pub const STIRRING_RANGE_RPM: (f64, f64) = (300.0, 800.0);

/// Finite design ranges, in field order (EG, AgNO3, PVP, NaCl, temperature,
/// stirring, duration). Used for optimizer normalization and sampling only;
/// validation bounds for volumes and duration are open-ended.
pub const DESIGN_RANGES: [(f64, f64); PARAM_DIM] = [
    (50.0, 200.0),  // ethylene glycol, mL
    (1.0, 10.0),    // AgNO3 solution, mL
    (2.0, 20.0),    // PVP solution, mL
    (0.1, 5.0),     // NaCl solution, mL
    TEMPERATURE_RANGE_C,
    STIRRING_RANGE_RPM,
    (10.0, 120.0), // reaction duration, minutes
];

/// Field names in the same order as [`DESIGN_RANGES`].
pub const PARAM_NAMES: [&str; PARAM_DIM] = [
    "eg_volume_ml",
    "agno3_volume_ml",
    "pvp_volume_ml",
    "nacl_volume_ml",
    "temperature_c",
    "stirring_rpm",
    "reaction_time_min",
];

/// Immutable parameter set for one synthesis run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentParameters {
    /// Ethylene glycol volume, mL.
    pub eg_volume_ml: f64,
    /// Silver nitrate solution volume, mL.
    pub agno3_volume_ml: f64,
    /// PVP capping-agent solution volume, mL.
    pub pvp_volume_ml: f64,
    /// Sodium chloride solution volume, mL.
    pub nacl_volume_ml: f64,
    /// Reaction temperature setpoint, degrees Celsius.
    pub temperature_c: f64,
    /// Stirring speed, RPM.
    pub stirring_rpm: f64,
    /// Reaction duration, minutes.
    pub reaction_time_min: f64,
}

impl Default for ExperimentParameters {
    /// The baseline polyol recipe.
    fn default() -> Self {
        Self {
            eg_volume_ml: 100.0,
            agno3_volume_ml: 5.0,
            pvp_volume_ml: 10.0,
            nacl_volume_ml: 1.0,
            temperature_c: 160.0,
            stirring_rpm: 500.0,
            reaction_time_min: 60.0,
        }
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> LabResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(LabError::InvalidParameter {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl ExperimentParameters {
    /// Validate every field against its declared bound.
    ///
    /// Volumes must be non-negative, temperature and stirring must lie within
    /// their closed ranges, and the duration must be strictly positive.
    pub fn validate(&self) -> LabResult<()> {
        check_range("eg_volume_ml", self.eg_volume_ml, 0.0, f64::INFINITY)?;
        check_range("agno3_volume_ml", self.agno3_volume_ml, 0.0, f64::INFINITY)?;
        check_range("pvp_volume_ml", self.pvp_volume_ml, 0.0, f64::INFINITY)?;
        check_range("nacl_volume_ml", self.nacl_volume_ml, 0.0, f64::INFINITY)?;
        check_range(
            "temperature_c",
            self.temperature_c,
            TEMPERATURE_RANGE_C.0,
            TEMPERATURE_RANGE_C.1,
        )?;
        check_range(
            "stirring_rpm",
            self.stirring_rpm,
            STIRRING_RANGE_RPM.0,
            STIRRING_RANGE_RPM.1,
        )?;
        if !self.reaction_time_min.is_finite() || self.reaction_time_min <= 0.0 {
            return Err(LabError::InvalidParameter {
                field: "reaction_time_min",
                value: self.reaction_time_min,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(())
    }

    /// Reaction duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.reaction_time_min * 60.0
    }

    /// Field values in [`DESIGN_RANGES`] order.
    pub fn as_array(&self) -> [f64; PARAM_DIM] {
        [
            self.eg_volume_ml,
            self.agno3_volume_ml,
            self.pvp_volume_ml,
            self.nacl_volume_ml,
            self.temperature_c,
            self.stirring_rpm,
            self.reaction_time_min,
        ]
    }

    /// Normalize into the `[0,1]` design cube (values outside a design range
    /// clamp to the nearest face; validation bounds are unaffected).
    pub fn to_unit(&self) -> [f64; PARAM_DIM] {
        let raw = self.as_array();
        let mut unit = [0.0; PARAM_DIM];
        for (i, ((lo, hi), v)) in DESIGN_RANGES.iter().zip(raw.iter()).enumerate() {
            unit[i] = ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
        }
        unit
    }

    /// Denormalize a point in the unit design cube into concrete parameters.
    pub fn from_unit(unit: &[f64; PARAM_DIM]) -> Self {
        let mut raw = [0.0; PARAM_DIM];
        for (i, ((lo, hi), u)) in DESIGN_RANGES.iter().zip(unit.iter()).enumerate() {
            raw[i] = lo + u.clamp(0.0, 1.0) * (hi - lo);
        }
        Self {
            eg_volume_ml: raw[0],
            agno3_volume_ml: raw[1],
            pvp_volume_ml: raw[2],
            nacl_volume_ml: raw[3],
            temperature_c: raw[4],
            stirring_rpm: raw[5],
            reaction_time_min: raw[6],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_recipe_is_valid() {
        assert!(ExperimentParameters::default().validate().is_ok());
    }

    #[test]
    fn test_temperature_bounds() {
        let mut p = ExperimentParameters::default();
        p.temperature_c = 139.9;
        assert!(matches!(
            p.validate().unwrap_err(),
            LabError::InvalidParameter {
                field: "temperature_c",
                ..
            }
        ));
        p.temperature_c = 180.1;
        assert!(p.validate().is_err());
        p.temperature_c = 180.0;
        assert!(p.validate().is_ok());
        p.temperature_c = 140.0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_stirring_bounds() {
        let mut p = ExperimentParameters::default();
        p.stirring_rpm = 299.0;
        assert!(p.validate().is_err());
        p.stirring_rpm = 801.0;
        assert!(p.validate().is_err());
        p.stirring_rpm = 300.0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut p = ExperimentParameters::default();
        p.pvp_volume_ml = -0.5;
        assert!(matches!(
            p.validate().unwrap_err(),
            LabError::InvalidParameter {
                field: "pvp_volume_ml",
                ..
            }
        ));
    }

    #[test]
    fn test_duration_must_be_positive() {
        let mut p = ExperimentParameters::default();
        p.reaction_time_min = 0.0;
        assert!(p.validate().is_err());
        p.reaction_time_min = f64::NAN;
        assert!(p.validate().is_err());
        p.reaction_time_min = 1.0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_unit_round_trip() {
        let p = ExperimentParameters::default();
        let q = ExperimentParameters::from_unit(&p.to_unit());
        for (a, b) in p.as_array().iter().zip(q.as_array().iter()) {
            assert!((a - b).abs() < 1e-9, "{a} != {b}");
        }
    }

    #[test]
    fn test_from_unit_stays_in_declared_bounds() {
        for u in [[0.0; PARAM_DIM], [1.0; PARAM_DIM], [0.5; PARAM_DIM]] {
            let p = ExperimentParameters::from_unit(&u);
            assert!(p.validate().is_ok());
        }
    }
}
