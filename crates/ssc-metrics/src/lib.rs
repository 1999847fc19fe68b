// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Calibration Metrics
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Probabilistic scoring of semantic completion volumes.
//!
//! Three read-only scores over `(probabilities, target)` pairs:
//! - **NLL**: mean `-ln p(true class)` over observed voxels.
//! - **CRPS**: ensemble CRPS against the one-hot target, averaged over
//!   observed voxels and classes.
//! - **ECE**: binned gap between confidence and outcome frequency,
//!   marginal over classes with equal-mass bins and a debiased L2 norm by
//!   default.
//!
//! # Ignore-label invariant
//!
//! Voxels labelled [`IGNORE_LABEL`](ssc_types::IGNORE_LABEL) are excluded
//! from every sum and every denominator. A target with no observed voxels
//! yields `Ok(None)`, never a silent zero.
//!
//! # Numerical degeneracy
//!
//! Probabilities are never clamped. A zero probability on the true class
//! makes NLL infinite; the score carries a `degenerate` count and a
//! warning is logged so the condition stays visible. With
//! `CalibrationConfig::strict` the same condition is returned as
//! `SscError::Numerical` instead.

pub mod crps;
pub mod ece;
pub mod frame;
pub mod nll;
pub mod score;

pub use crps::{crps, crps_ensemble};
pub use ece::{ece, reliability_bins, ReliabilityBin};
pub use frame::score_frame;
pub use nll::{nll, nll_strict};
pub use score::{CalibrationSummary, FrameScores, MetricScore};

use ssc_types::{ClassVolume, LabelVolume, SscError, SscResult, IGNORE_LABEL};

/// Check that a prediction and a target cover the same grid, and that
/// every observed label names a predicted class.
pub(crate) fn check_pair(probs: &ClassVolume, target: &LabelVolume) -> SscResult<()> {
    if probs.shape != target.shape {
        return Err(SscError::Contract(format!(
            "prediction grid {} does not match target grid {}",
            probs.shape, target.shape
        )));
    }
    if let Some(&bad) = target
        .data
        .iter()
        .find(|&&l| l != IGNORE_LABEL && l as usize >= probs.classes)
    {
        return Err(SscError::Contract(format!(
            "target label {bad} out of range for {} classes",
            probs.classes
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use ssc_types::{ClassVolume, GridShape, LabelVolume};

    /// Build a probability volume from per-voxel class rows.
    pub fn probs(shape: GridShape, rows: &[&[f32]]) -> ClassVolume {
        let n = shape.num_voxels();
        assert_eq!(rows.len(), n);
        let classes = rows[0].len();
        let mut data = vec![0.0f32; classes * n];
        for (v, row) in rows.iter().enumerate() {
            for (c, &p) in row.iter().enumerate() {
                data[c * n + v] = p;
            }
        }
        ClassVolume::new(classes, shape, data).unwrap()
    }

    pub fn labels(shape: GridShape, data: &[u8]) -> LabelVolume {
        LabelVolume::new(shape, data.to_vec()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssc_types::GridShape;

    #[test]
    fn test_check_pair_shape_mismatch() {
        let probs = ClassVolume::zeros(2, GridShape::new(1, 1, 2)).unwrap();
        let target = LabelVolume::filled(GridShape::new(1, 2, 1), 0);
        assert!(matches!(
            check_pair(&probs, &target),
            Err(SscError::Contract(_))
        ));
    }

    #[test]
    fn test_check_pair_label_out_of_range() {
        let shape = GridShape::new(1, 1, 2);
        let probs = ClassVolume::zeros(2, shape).unwrap();
        let target = LabelVolume::new(shape, vec![1, 2]).unwrap();
        assert!(check_pair(&probs, &target).is_err());
        let ignored = LabelVolume::new(shape, vec![1, IGNORE_LABEL]).unwrap();
        assert!(check_pair(&probs, &ignored).is_ok());
    }
}
