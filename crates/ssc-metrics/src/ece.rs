// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Expected Calibration Error
// ─────────────────────────────────────────────────────────────────────
//! Binned calibration error of a probability volume.
//!
//! Every estimate reduces to a 1-D problem over `(confidence, outcome)`
//! pairs with outcome in {0, 1}:
//!
//! - [`EceMode::TopLabel`]: the winning-class probability against
//!   argmax == label.
//! - [`EceMode::Marginal`]: each class probability against
//!   label == class, aggregated as `(mean_k ce_k^p)^(1/p)`.
//!
//! A sample lands in the first bin whose upper edge is `>= confidence`.
//! Each bin contributes `n_b / N · |mean(outcome - conf)|^p`, and the sum
//! is raised to `1/p`. With `p = 2` and debiasing, the squared gap of a
//! bin is reduced by `ȳ(1 - ȳ) / (n_b - 1)`, bins of one sample count as
//! zero, and a negative total is floored at zero before the square root.

use serde::{Deserialize, Serialize};

use ssc_types::{
    CalibrationConfig, ClassVolume, EceBinning, EceMode, LabelVolume, SscError, SscResult,
    IGNORE_LABEL,
};

use crate::check_pair;
use crate::score::MetricScore;

/// A single bin of the reliability diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityBin {
    pub range: (f64, f64),
    pub avg_confidence: f64,
    pub accuracy: f64,
    pub count: usize,
}

impl ReliabilityBin {
    pub fn calibration_error(&self) -> f64 {
        (self.accuracy - self.avg_confidence).abs()
    }
}

#[derive(Clone, Copy, Default)]
struct BinAcc {
    conf_sum: f64,
    outcome_sum: f64,
    count: usize,
}

impl BinAcc {
    fn gap(&self) -> f64 {
        (self.outcome_sum - self.conf_sum) / self.count as f64
    }
}

// ─── Bin edges ──────────────────────────────────────────────────────

fn equal_width_edges(num_bins: usize) -> Vec<f64> {
    (1..=num_bins).map(|i| i as f64 / num_bins as f64).collect()
}

/// Upper edges splitting `sorted` into at most `num_bins` runs of equal
/// length (the first `n % bins` runs hold one extra sample). The last
/// edge is always 1.0; duplicate edges collapse.
fn equal_mass_edges(sorted: &[f64], num_bins: usize) -> Vec<f64> {
    let n = sorted.len();
    let parts = num_bins.min(n).max(1);
    let (base, extra) = (n / parts, n % parts);
    let mut edges = Vec::with_capacity(parts);
    let mut end = 0usize;
    for i in 0..parts - 1 {
        end += base + usize::from(i < extra);
        edges.push((sorted[end - 1] + sorted[end]) / 2.0);
    }
    edges.push(1.0);
    edges.sort_by(f64::total_cmp);
    edges.dedup();
    edges
}

fn edge_bin(edges: &[f64], conf: f64) -> usize {
    edges.partition_point(|&e| e < conf).min(edges.len() - 1)
}

fn edges_for(points: &[(f64, f64)], cfg: &CalibrationConfig) -> Vec<f64> {
    match cfg.ece_binning {
        EceBinning::EqualWidth => equal_width_edges(cfg.ece_bins),
        EceBinning::EqualMass => {
            let mut sorted: Vec<f64> = points.iter().map(|&(c, _)| c).collect();
            sorted.sort_by(f64::total_cmp);
            equal_mass_edges(&sorted, cfg.ece_bins)
        }
    }
}

// ─── 1-D estimate ───────────────────────────────────────────────────

fn fill_bins(points: &[(f64, f64)], edges: &[f64]) -> Vec<BinAcc> {
    let mut bins = vec![BinAcc::default(); edges.len()];
    for &(conf, outcome) in points {
        let bin = &mut bins[edge_bin(edges, conf)];
        bin.conf_sum += conf;
        bin.outcome_sum += outcome;
        bin.count += 1;
    }
    bins
}

fn calibration_error_1d(points: &[(f64, f64)], cfg: &CalibrationConfig) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let bins = fill_bins(points, &edges_for(points, cfg));
    let total = points.len() as f64;

    if cfg.ece_norm == 2 && cfg.ece_debias {
        let squared: f64 = bins
            .iter()
            .filter(|b| b.count >= 2)
            .map(|b| {
                let n = b.count as f64;
                let mean_outcome = b.outcome_sum / n;
                let variance = mean_outcome * (1.0 - mean_outcome) / (n - 1.0);
                (n / total) * (b.gap().powi(2) - variance)
            })
            .sum();
        return squared.max(0.0).sqrt();
    }

    let p = cfg.ece_norm as i32;
    let weighted: f64 = bins
        .iter()
        .filter(|b| b.count > 0)
        .map(|b| (b.count as f64 / total) * b.gap().abs().powi(p))
        .sum();
    weighted.powf(1.0 / p as f64)
}

// ─── Volume adapters ────────────────────────────────────────────────

/// Winning class and its probability at one voxel.
fn top_label(probs: &ClassVolume, v: usize) -> (usize, f64) {
    let mut best = 0usize;
    let mut best_p = probs.get(0, v);
    for c in 1..probs.classes {
        let p = probs.get(c, v);
        if p > best_p {
            best = c;
            best_p = p;
        }
    }
    (best, best_p as f64)
}

fn top_label_points(probs: &ClassVolume, target: &LabelVolume) -> Vec<(f64, f64)> {
    target
        .data
        .iter()
        .enumerate()
        .filter(|&(_, &label)| label != IGNORE_LABEL)
        .map(|(v, &label)| {
            let (pred, conf) = top_label(probs, v);
            (conf, f64::from(u8::from(pred == label as usize)))
        })
        .collect()
}

fn class_points(probs: &ClassVolume, target: &LabelVolume, class: usize) -> Vec<(f64, f64)> {
    target
        .data
        .iter()
        .enumerate()
        .filter(|&(_, &label)| label != IGNORE_LABEL)
        .map(|(v, &label)| {
            (
                probs.get(class, v) as f64,
                f64::from(u8::from(label as usize == class)),
            )
        })
        .collect()
}

fn marginal_error(probs: &ClassVolume, target: &LabelVolume, cfg: &CalibrationConfig) -> f64 {
    let p = cfg.ece_norm as i32;
    let mean_power = (0..probs.classes)
        .map(|c| calibration_error_1d(&class_points(probs, target, c), cfg).powi(p))
        .sum::<f64>()
        / probs.classes as f64;
    mean_power.powf(1.0 / p as f64)
}

/// Expected calibration error over observed voxels.
pub fn ece(
    probs: &ClassVolume,
    target: &LabelVolume,
    cfg: &CalibrationConfig,
) -> SscResult<Option<MetricScore>> {
    cfg.validate()?;
    check_pair(probs, target)?;

    let samples = target.valid_count();
    if samples == 0 {
        return Ok(None);
    }

    let value = match cfg.ece_mode {
        EceMode::TopLabel => calibration_error_1d(&top_label_points(probs, target), cfg),
        EceMode::Marginal => marginal_error(probs, target, cfg),
    };
    Ok(Some(MetricScore::new(value, samples)))
}

/// Top-label reliability diagram over equal-width bins. Empty bins are
/// omitted.
pub fn reliability_bins(
    probs: &ClassVolume,
    target: &LabelVolume,
    num_bins: usize,
) -> SscResult<Vec<ReliabilityBin>> {
    if num_bins == 0 {
        return Err(SscError::Config("reliability diagram needs at least one bin".into()));
    }
    check_pair(probs, target)?;
    let width = 1.0 / num_bins as f64;
    let bins = fill_bins(&top_label_points(probs, target), &equal_width_edges(num_bins));
    Ok(bins
        .iter()
        .enumerate()
        .filter(|(_, b)| b.count > 0)
        .map(|(i, b)| ReliabilityBin {
            range: (i as f64 * width, (i + 1) as f64 * width),
            avg_confidence: b.conf_sum / b.count as f64,
            accuracy: b.outcome_sum / b.count as f64,
            count: b.count,
        })
        .collect())
}
