// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Loss Terms
// ─────────────────────────────────────────────────────────────────────
//! Loss-function collaborators for the training step.
//!
//! Each term maps `(prediction, target, class_weights[, alpha])` to a
//! scalar. The step dispatcher only assembles the named results; the
//! semantic-scalar and geometric-scalar terms are supplied from outside
//! through [`ExternalLoss`].

use serde::Serialize;
use ssc_types::{ClassVolume, LabelVolume, SscError, SscResult, IGNORE_LABEL};

/// Named loss terms and their result keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    CrossEntropy,
    SemanticScalar,
    GeometricScalar,
    /// Binary occupancy loss of the proposal network.
    Occupancy,
}

impl LossKind {
    pub fn key(self) -> &'static str {
        match self {
            LossKind::CrossEntropy => "loss_ssc",
            LossKind::SemanticScalar => "loss_sem_scal",
            LossKind::GeometricScalar => "loss_geo_scal",
            LossKind::Occupancy => "loss_sc_level_1",
        }
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Inputs shared by every loss term.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Raw logits.
    pub prediction: &'a ClassVolume,
    pub target: &'a LabelVolume,
    pub class_weights: &'a [f64],
    pub alpha: Option<f64>,
}

impl LossInputs<'_> {
    fn check(&self) -> SscResult<()> {
        if self.prediction.shape != self.target.shape {
            return Err(SscError::Contract(format!(
                "prediction grid {} does not match target grid {}",
                self.prediction.shape, self.target.shape
            )));
        }
        if self.class_weights.len() != self.prediction.classes {
            return Err(SscError::Contract(format!(
                "{} class weights for {} classes",
                self.class_weights.len(),
                self.prediction.classes
            )));
        }
        Ok(())
    }
}

/// Trait for scalar loss collaborators.
pub trait LossTerm: Send + Sync {
    fn compute(&self, inputs: &LossInputs<'_>) -> SscResult<f64>;
}

/// Class-weighted softmax cross-entropy over non-ignored voxels.
///
/// `L = Σ w[y]·(-log softmax(x)[y]) / Σ w[y]`; a target with no valid
/// voxel gives `0.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedCrossEntropy;

impl LossTerm for WeightedCrossEntropy {
    fn compute(&self, inputs: &LossInputs<'_>) -> SscResult<f64> {
        inputs.check()?;
        let logits = inputs.prediction;
        let n = logits.num_voxels();
        let classes = logits.classes;

        let mut num = 0.0f64;
        let mut den = 0.0f64;
        for (v, &label) in inputs.target.data.iter().enumerate() {
            if label == IGNORE_LABEL {
                continue;
            }
            let y = label as usize;
            if y >= classes {
                return Err(SscError::Contract(format!(
                    "target label {y} at voxel {v} outside {classes} classes"
                )));
            }
            let max = (0..classes)
                .map(|c| logits.data[c * n + v] as f64)
                .fold(f64::NEG_INFINITY, f64::max);
            let lse = (0..classes)
                .map(|c| (logits.data[c * n + v] as f64 - max).exp())
                .sum::<f64>()
                .ln()
                + max;
            let w = inputs.class_weights[y];
            num += w * (lse - logits.data[y * n + v] as f64);
            den += w;
        }

        if den == 0.0 {
            log::debug!("cross-entropy over an all-ignored target");
            return Ok(0.0);
        }
        Ok(num / den)
    }
}

type LossFn = Box<dyn Fn(&LossInputs<'_>) -> SscResult<f64> + Send + Sync>;

/// Loss term delegating to a caller-supplied function.
pub struct ExternalLoss {
    loss_fn: LossFn,
}

impl ExternalLoss {
    pub fn new(loss_fn: impl Fn(&LossInputs<'_>) -> SscResult<f64> + Send + Sync + 'static) -> Self {
        Self {
            loss_fn: Box::new(loss_fn),
        }
    }
}

impl LossTerm for ExternalLoss {
    fn compute(&self, inputs: &LossInputs<'_>) -> SscResult<f64> {
        (self.loss_fn)(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssc_types::GridShape;

    const SHAPE: GridShape = GridShape::new(1, 1, 2);

    fn logits(c0: [f32; 2], c1: [f32; 2]) -> ClassVolume {
        ClassVolume::new(2, SHAPE, vec![c0[0], c0[1], c1[0], c1[1]]).unwrap()
    }

    #[test]
    fn test_keys() {
        assert_eq!(LossKind::CrossEntropy.key(), "loss_ssc");
        assert_eq!(LossKind::SemanticScalar.key(), "loss_sem_scal");
        assert_eq!(LossKind::GeometricScalar.key(), "loss_geo_scal");
        assert_eq!(LossKind::Occupancy.to_string(), "loss_sc_level_1");
    }

    #[test]
    fn test_uniform_logits_give_ln_classes() {
        let pred = logits([0.0, 0.0], [0.0, 0.0]);
        let target = LabelVolume::new(SHAPE, vec![0, 1]).unwrap();
        let loss = WeightedCrossEntropy
            .compute(&LossInputs {
                prediction: &pred,
                target: &target,
                class_weights: &[1.0, 1.0],
                alpha: None,
            })
            .unwrap();
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-9);
    }

    #[test]
    fn test_class_weights_and_ignore() {
        // voxel 0: label 1, confident → ~0; voxel 1 ignored
        let pred = logits([0.0, 100.0], [50.0, 0.0]);
        let target = LabelVolume::new(SHAPE, vec![1, IGNORE_LABEL]).unwrap();
        let loss = WeightedCrossEntropy
            .compute(&LossInputs {
                prediction: &pred,
                target: &target,
                class_weights: &[1.0, 3.0],
                alpha: None,
            })
            .unwrap();
        assert!(loss.abs() < 1e-9);
    }

    #[test]
    fn test_weighted_mean() {
        // voxel 0 label 0 with loss ln2, voxel 1 label 1 with loss ≈ 50
        let pred = logits([0.0, 50.0], [0.0, 0.0]);
        let target = LabelVolume::new(SHAPE, vec![0, 1]).unwrap();
        let loss = WeightedCrossEntropy
            .compute(&LossInputs {
                prediction: &pred,
                target: &target,
                class_weights: &[1.0, 3.0],
                alpha: None,
            })
            .unwrap();
        let expected = (std::f64::consts::LN_2 + 3.0 * 50.0) / 4.0;
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let pred = logits([0.0, 0.0], [1.0, 1.0]);
        let target = LabelVolume::filled(SHAPE, IGNORE_LABEL);
        let inputs = LossInputs {
            prediction: &pred,
            target: &target,
            class_weights: &[1.0, 1.0],
            alpha: None,
        };
        assert_eq!(WeightedCrossEntropy.compute(&inputs).unwrap(), 0.0);
    }

    #[test]
    fn test_contract_checks() {
        let pred = logits([0.0, 0.0], [0.0, 0.0]);
        let target = LabelVolume::new(SHAPE, vec![0, 7]).unwrap();
        let bad_label = LossInputs {
            prediction: &pred,
            target: &target,
            class_weights: &[1.0, 1.0],
            alpha: None,
        };
        assert!(WeightedCrossEntropy.compute(&bad_label).is_err());
        let ok_target = LabelVolume::new(SHAPE, vec![0, 1]).unwrap();
        let bad_weights = LossInputs {
            class_weights: &[1.0],
            target: &ok_target,
            ..bad_label
        };
        assert!(WeightedCrossEntropy.compute(&bad_weights).is_err());
    }

    #[test]
    fn test_external_loss_receives_alpha() {
        let term = ExternalLoss::new(|i| Ok(i.alpha.unwrap_or(-1.0)));
        let pred = logits([0.0, 0.0], [0.0, 0.0]);
        let target = LabelVolume::filled(SHAPE, 0);
        let inputs = LossInputs {
            prediction: &pred,
            target: &target,
            class_weights: &[1.0, 1.0],
            alpha: Some(0.5),
        };
        assert_eq!(term.compute(&inputs).unwrap(), 0.5);
    }
}
