// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Per-Frame Calibration Scoring
// ─────────────────────────────────────────────────────────────────────

use ssc_types::{CalibrationConfig, ClassVolume, LabelVolume, SscError, SscResult};

use crate::score::FrameScores;
use crate::{crps_ensemble, ece, nll, nll_strict};

/// Score one frame from its ensemble of probability volumes.
///
/// NLL and ECE use the member mean; CRPS uses the members themselves.
/// A single-member "ensemble" is accepted, its CRPS degenerates to the
/// mean absolute error against the one-hot target.
pub fn score_frame(
    members: &[ClassVolume],
    target: &LabelVolume,
    cfg: &CalibrationConfig,
) -> SscResult<FrameScores> {
    if members.is_empty() {
        return Err(SscError::Contract(
            "cannot score a frame without predictions".into(),
        ));
    }
    let mean = ClassVolume::mean(members)?;
    let refs: Vec<&ClassVolume> = members.iter().collect();

    let nll = if cfg.strict {
        nll_strict(&mean, target)?
    } else {
        nll(&mean, target)?
    };
    let crps = crps_ensemble(&refs, target)?;
    let ece = ece(&mean, target, cfg)?;

    log::debug!(
        "scored frame: {} members, {} observed voxels",
        members.len(),
        target.valid_count()
    );

    Ok(FrameScores {
        nll: nll.map(|s| s.value),
        crps: crps.map(|s| s.value),
        ece: ece.map(|s| s.value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{labels, probs};
    use ssc_types::GridShape;

    #[test]
    fn test_score_frame_all_ignored() {
        let shape = GridShape::new(1, 2, 2);
        let rows: Vec<&[f32]> = (0..4).map(|_| &[0.3f32, 0.7][..]).collect();
        let p = probs(shape, &rows);
        let t = labels(shape, &[255; 4]);
        let scores = score_frame(&[p], &t, &CalibrationConfig::default()).unwrap();
        assert_eq!(scores, FrameScores::default());
    }

    #[test]
    fn test_score_frame_uses_member_mean_for_nll() {
        let shape = GridShape::new(1, 1, 1);
        let a = probs(shape, &[&[0.0, 1.0]]);
        let b = probs(shape, &[&[0.5, 0.5]]);
        let t = labels(shape, &[1]);
        let scores = score_frame(&[a, b], &t, &CalibrationConfig::default()).unwrap();
        let expected = -(0.75f64).ln();
        assert!((scores.nll.unwrap() - expected).abs() < 1e-6);
        assert!(scores.crps.unwrap() > 0.0);
        assert!(scores.ece.is_some());
    }

    #[test]
    fn test_strict_score_frame_surfaces_degeneracy() {
        let shape = GridShape::new(1, 1, 1);
        let p = probs(shape, &[&[1.0, 0.0]]);
        let t = labels(shape, &[1]);
        let lenient = score_frame(&[p.clone()], &t, &CalibrationConfig::default()).unwrap();
        assert!(lenient.nll.unwrap().is_infinite());

        let strict = CalibrationConfig {
            strict: true,
            ..CalibrationConfig::default()
        };
        assert!(matches!(
            score_frame(&[p], &t, &strict),
            Err(SscError::Numerical(_))
        ));
    }

    #[test]
    fn test_score_frame_requires_members() {
        let t = labels(GridShape::new(1, 1, 1), &[0]);
        assert!(score_frame(&[], &t, &CalibrationConfig::default()).is_err());
    }
}
