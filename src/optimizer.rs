//! Surrogate-model suggestion engine for the next experiment.
//!
//! A Gaussian-process regression over the normalized design cube is fit to
//! the completed-experiment history, and an upper-confidence-bound (UCB)
//! acquisition picks the next parameter set from a seeded candidate pool.
//! Everything here is pure CPU work over plain `Vec<f64>` buffers; the
//! supervisor runs it on a blocking thread and may cancel a fit when a newer
//! request supersedes it.
//!
//! # Cold start
//!
//! With fewer than `cold_start_min_records` observations a GP fit is not
//! meaningful. The engine instead samples uniformly from the design ranges
//! and reports a fixed low confidence, so a campaign can bootstrap itself
//! from an empty history. `InsufficientData` is returned only when the
//! history is empty *and* cold-start sampling has been disabled.
//!
//! # Determinism
//!
//! All randomness (candidate sampling, jitter, cold-start draws) flows from
//! one `ChaCha8Rng`. The same history, settings, and seed reproduce the same
//! suggestion bit for bit.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{LabError, LabResult};
use crate::history::ExperimentRecord;
use crate::outcome::TargetMetric;
use crate::params::{ExperimentParameters, PARAM_DIM};

/// Number of jittered copies of the best observed point added to the
/// candidate pool, so the acquisition can exploit locally as well as explore.
const BEST_POINT_JITTER_COPIES: usize = 16;
/// Half-width of the per-dimension jitter around the best point, in unit-cube
/// coordinates.
const BEST_POINT_JITTER: f64 = 0.08;
/// How many candidates to score between cancellation checks.
const CANCEL_CHECK_STRIDE: usize = 32;

/// Tunables for the suggestion engine; see the `[optimizer]` section of the
/// settings file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Uniform candidates drawn per suggestion.
    pub candidates: usize,
    /// Exploration weight in the UCB acquisition `mean + beta * sigma`.
    pub ucb_beta: f64,
    /// RBF kernel length scale in unit-cube coordinates.
    pub length_scale: f64,
    /// Observation noise standard deviation (standardized units).
    pub noise_sigma: f64,
    /// Minimum history size for a GP fit; below this the cold-start path
    /// runs instead.
    pub cold_start_min_records: usize,
    /// Confidence reported for cold-start suggestions.
    pub cold_start_confidence: f64,
    /// Whether an empty or tiny history falls back to uniform sampling.
    /// When false, an empty history is an `InsufficientData` error.
    pub cold_start_sampling: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            candidates: 256,
            ucb_beta: 1.0,
            length_scale: 0.5,
            noise_sigma: 0.1,
            cold_start_min_records: 2,
            cold_start_confidence: 0.2,
            cold_start_sampling: true,
        }
    }
}

/// Predicted metric range for a suggestion, in the metric's natural units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictedRange {
    /// Posterior mean.
    pub mean: f64,
    /// Lower edge of the 95% interval.
    pub low: f64,
    /// Upper edge of the 95% interval.
    pub high: f64,
}

/// A suggested next experiment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    /// Parameter set to run next. Always within validation bounds.
    pub params: ExperimentParameters,
    /// Predicted outcome range; `None` on the cold-start path, where the
    /// model has nothing to predict from.
    pub predicted: Option<PredictedRange>,
    /// Model confidence in `[0, 1]`: 1 minus the ratio of posterior to prior
    /// standard deviation at the chosen point.
    pub confidence: f64,
    /// The metric this suggestion optimizes.
    pub metric: TargetMetric,
}

/// Cooperative cancellation handle for an in-flight fit.
///
/// Cloning shares the flag. A cancelled fit returns `Ok(None)` at its next
/// check rather than an error; supersession is a normal outcome, not a
/// failure.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Suggest the next experiment for `metric` given the completed history.
///
/// Returns `Ok(None)` when the fit was cancelled mid-way, and
/// `Err(InsufficientData)` when the history is empty and cold-start sampling
/// is disabled. The history slice is a snapshot; the caller decides how
/// fresh it needs to be.
pub fn suggest_next(
    history: &[Arc<ExperimentRecord>],
    metric: TargetMetric,
    seed: Option<u64>,
    settings: &OptimizerSettings,
    cancel: &CancelToken,
) -> LabResult<Option<OptimizationSuggestion>> {
    let seed = seed.unwrap_or_else(rand::random);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    if history.len() < settings.cold_start_min_records.max(1) {
        if history.is_empty() && !settings.cold_start_sampling {
            return Err(LabError::InsufficientData);
        }
        debug!(
            records = history.len(),
            %metric,
            "history too small for a surrogate fit; sampling design space"
        );
        return Ok(Some(cold_start_suggestion(metric, settings, &mut rng)));
    }

    // Training set in unit-cube coordinates, targets standardized so the
    // prior variance is 1 regardless of the metric's scale.
    let x: Vec<[f64; PARAM_DIM]> = history.iter().map(|r| r.params.to_unit()).collect();
    let y_raw: Vec<f64> = history
        .iter()
        .map(|r| metric.value_of(&r.outcome))
        .collect();
    let (y, y_mean, y_std) = standardize(&y_raw);

    let n = x.len();
    let noise_var = settings.noise_sigma * settings.noise_sigma;
    let mut kernel = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let k = rbf(&x[i], &x[j], settings.length_scale);
            kernel[i * n + j] = k;
            kernel[j * n + i] = k;
        }
        kernel[i * n + i] += noise_var;
    }

    let Some(chol) = cholesky_with_jitter(&kernel, n) else {
        // A degenerate history (e.g. identical parameter sets) can defeat
        // the factorization even with jitter; fall back to sampling rather
        // than wedging the campaign.
        warn!(records = n, "surrogate fit failed to factorize; falling back to sampling");
        return Ok(Some(cold_start_suggestion(metric, settings, &mut rng)));
    };
    let alpha = chol.solve(&y);

    // Candidate pool: uniform coverage of the cube plus jittered copies of
    // the best observed point.
    let mut candidates: Vec<[f64; PARAM_DIM]> = Vec::with_capacity(
        settings.candidates + BEST_POINT_JITTER_COPIES,
    );
    for _ in 0..settings.candidates {
        let mut point = [0.0; PARAM_DIM];
        for value in &mut point {
            *value = rng.gen_range(0.0..=1.0);
        }
        candidates.push(point);
    }
    if let Some(best_idx) = argmax(&y_raw) {
        let best = x[best_idx];
        for _ in 0..BEST_POINT_JITTER_COPIES {
            let mut point = best;
            for value in &mut point {
                *value = (*value + rng.gen_range(-BEST_POINT_JITTER..=BEST_POINT_JITTER))
                    .clamp(0.0, 1.0);
            }
            candidates.push(point);
        }
    }

    let sigma_prior = (1.0 + noise_var).sqrt();
    let mut best_score = f64::NEG_INFINITY;
    let mut best_pick: Option<(usize, f64, f64)> = None; // (index, mean, sigma)
    for (idx, candidate) in candidates.iter().enumerate() {
        if idx % CANCEL_CHECK_STRIDE == 0 && cancel.is_cancelled() {
            debug!(scored = idx, "surrogate fit cancelled; newer request supersedes it");
            return Ok(None);
        }
        let k_star: Vec<f64> = x
            .iter()
            .map(|xi| rbf(candidate, xi, settings.length_scale))
            .collect();
        let mean: f64 = k_star.iter().zip(alpha.iter()).map(|(k, a)| k * a).sum();
        let v = chol.forward_substitute(&k_star);
        let explained: f64 = v.iter().map(|vi| vi * vi).sum();
        let variance = (1.0 + noise_var - explained).max(0.0);
        let sigma = variance.sqrt();
        let score = mean + settings.ucb_beta * sigma;
        if score > best_score {
            best_score = score;
            best_pick = Some((idx, mean, sigma));
        }
    }
    let Some((idx, mean, sigma)) = best_pick else {
        // Candidate pool can only be empty if configured to zero; sample.
        return Ok(Some(cold_start_suggestion(metric, settings, &mut rng)));
    };

    let params = ExperimentParameters::from_unit(&candidates[idx]);
    let confidence = (1.0 - sigma / sigma_prior).clamp(0.0, 1.0);
    let mean_natural = mean * y_std + y_mean;
    let half_width = 1.96 * sigma * y_std;
    debug!(
        records = n,
        %metric,
        confidence,
        predicted_mean = mean_natural,
        "surrogate suggestion ready"
    );
    Ok(Some(OptimizationSuggestion {
        params,
        predicted: Some(PredictedRange {
            mean: mean_natural,
            low: mean_natural - half_width,
            high: mean_natural + half_width,
        }),
        confidence,
        metric,
    }))
}

fn cold_start_suggestion(
    metric: TargetMetric,
    settings: &OptimizerSettings,
    rng: &mut ChaCha8Rng,
) -> OptimizationSuggestion {
    let mut unit = [0.0; PARAM_DIM];
    for value in &mut unit {
        *value = rng.gen_range(0.0..=1.0);
    }
    OptimizationSuggestion {
        params: ExperimentParameters::from_unit(&unit),
        predicted: None,
        confidence: settings.cold_start_confidence,
        metric,
    }
}

/// Squared-exponential kernel over unit-cube points.
fn rbf(a: &[f64; PARAM_DIM], b: &[f64; PARAM_DIM], length_scale: f64) -> f64 {
    let mut dist_sq = 0.0;
    for (ai, bi) in a.iter().zip(b.iter()) {
        let d = ai - bi;
        dist_sq += d * d;
    }
    (-dist_sq / (2.0 * length_scale * length_scale)).exp()
}

/// Standardize to zero mean and unit (population) variance. A flat target
/// vector keeps a unit scale so de-standardization stays finite.
fn standardize(y: &[f64]) -> (Vec<f64>, f64, f64) {
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let var = y.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
    (y.iter().map(|v| (v - mean) / std).collect(), mean, std)
}

fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Lower-triangular Cholesky factor of an `n x n` row-major matrix.
struct Cholesky {
    l: Vec<f64>,
    n: usize,
}

impl Cholesky {
    /// Factorize a symmetric positive-definite matrix; `None` when a pivot
    /// goes non-positive.
    fn factorize(matrix: &[f64], n: usize) -> Option<Self> {
        let mut l = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = matrix[i * n + j];
                for k in 0..j {
                    sum -= l[i * n + k] * l[j * n + k];
                }
                if i == j {
                    if sum <= 0.0 {
                        return None;
                    }
                    l[i * n + i] = sum.sqrt();
                } else {
                    l[i * n + j] = sum / l[j * n + j];
                }
            }
        }
        Some(Self { l, n })
    }

    /// Solve `L z = b`.
    fn forward_substitute(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut z = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= self.l[i * n + k] * z[k];
            }
            z[i] = sum / self.l[i * n + i];
        }
        z
    }

    /// Solve `(L L^T) x = b`.
    fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = self.forward_substitute(b);
        for i in (0..n).rev() {
            let mut sum = x[i];
            for k in (i + 1)..n {
                sum -= self.l[k * n + i] * x[k];
            }
            x[i] = sum / self.l[i * n + i];
        }
        x
    }
}

/// Factorize with escalating diagonal jitter. Kernel matrices built from
/// near-duplicate observations are ill-conditioned in exact arithmetic.
fn cholesky_with_jitter(matrix: &[f64], n: usize) -> Option<Cholesky> {
    if let Some(chol) = Cholesky::factorize(matrix, n) {
        return Some(chol);
    }
    let mut jitter = 1e-8;
    for _ in 0..5 {
        let mut padded = matrix.to_vec();
        for i in 0..n {
            padded[i * n + i] += jitter;
        }
        if let Some(chol) = Cholesky::factorize(&padded, n) {
            return Some(chol);
        }
        jitter *= 10.0;
    }
    None
}
