//! Measured outcomes of a completed synthesis run.
//!
//! An [`ExperimentOutcome`] is produced by the external characterization
//! collaborator once a run completes; the controller only defines its shape
//! and invariants. The aspect ratio is derived from the two measured
//! dimensions (length converted to nm over diameter) so it can never drift
//! out of sync with them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LabError, LabResult};

/// Measured product metrics for one completed run. Immutable once recorded.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOutcome {
    /// Mean nanowire diameter, nm.
    pub diameter_nm: f64,
    /// Mean nanowire length, micrometers.
    pub length_um: f64,
    /// Synthesis yield, percent in `[0, 100]`.
    pub yield_percent: f64,
}

impl ExperimentOutcome {
    /// Construct a validated outcome.
    ///
    /// Diameter and length must be strictly positive and finite; yield must
    /// lie in `[0, 100]`.
    pub fn new(diameter_nm: f64, length_um: f64, yield_percent: f64) -> LabResult<Self> {
        if !diameter_nm.is_finite() || diameter_nm <= 0.0 {
            return Err(LabError::InvalidParameter {
                field: "diameter_nm",
                value: diameter_nm,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        if !length_um.is_finite() || length_um <= 0.0 {
            return Err(LabError::InvalidParameter {
                field: "length_um",
                value: length_um,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        if !yield_percent.is_finite() || !(0.0..=100.0).contains(&yield_percent) {
            return Err(LabError::InvalidParameter {
                field: "yield_percent",
                value: yield_percent,
                min: 0.0,
                max: 100.0,
            });
        }
        Ok(Self {
            diameter_nm,
            length_um,
            yield_percent,
        })
    }

    /// Aspect ratio: length (converted to nm) over diameter.
    pub fn aspect_ratio(&self) -> f64 {
        self.length_um * 1000.0 / self.diameter_nm
    }
}

/// The property a campaign is optimizing for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    /// Length over diameter; the primary quality metric. Maximized.
    AspectRatio,
    /// Mean diameter in nm. Maximized (callers wanting thin wires negate
    /// upstream by supplying inverted outcomes).
    Diameter,
    /// Yield percentage. Maximized.
    Yield,
}

impl TargetMetric {
    /// Extract this metric's value from an outcome.
    pub fn value_of(&self, outcome: &ExperimentOutcome) -> f64 {
        match self {
            TargetMetric::AspectRatio => outcome.aspect_ratio(),
            TargetMetric::Diameter => outcome.diameter_nm,
            TargetMetric::Yield => outcome.yield_percent,
        }
    }

    /// Stable machine name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMetric::AspectRatio => "aspect_ratio",
            TargetMetric::Diameter => "diameter",
            TargetMetric::Yield => "yield",
        }
    }
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TargetMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aspect_ratio" => Ok(TargetMetric::AspectRatio),
            "diameter" => Ok(TargetMetric::Diameter),
            "yield" => Ok(TargetMetric::Yield),
            other => Err(format!(
                "unknown target metric '{other}' (expected aspect_ratio, diameter, or yield)"
            )),
        }
    }
}
