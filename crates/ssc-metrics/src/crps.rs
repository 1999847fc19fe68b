// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Continuous Ranked Probability Score
// ─────────────────────────────────────────────────────────────────────
//! Ensemble CRPS per class channel against the one-hot target:
//!
//! `CRPS(x, y) = E|X - y| - ½ E|X - X'|`
//!
//! with `X, X'` drawn from the ensemble members. The pairwise term is
//! evaluated from the sorted members in `O(M log M)`. With a single
//! member this reduces to `|p - y|`.

use ssc_types::{ClassVolume, LabelVolume, SscError, SscResult, IGNORE_LABEL};

use crate::check_pair;
use crate::score::MetricScore;

/// CRPS of a single probabilistic prediction.
pub fn crps(probs: &ClassVolume, target: &LabelVolume) -> SscResult<Option<MetricScore>> {
    crps_ensemble(&[probs], target)
}

/// CRPS of an ensemble of probability volumes, averaged over observed
/// voxels and classes.
pub fn crps_ensemble(
    members: &[&ClassVolume],
    target: &LabelVolume,
) -> SscResult<Option<MetricScore>> {
    let first = members
        .first()
        .ok_or_else(|| SscError::Contract("CRPS needs at least one ensemble member".into()))?;
    for m in members {
        if m.classes != first.classes || m.shape != first.shape {
            return Err(SscError::Contract(format!(
                "ensemble member {}x{} does not match {}x{}",
                m.classes, m.shape, first.classes, first.shape
            )));
        }
    }
    check_pair(first, target)?;

    let m = members.len();
    let m_sq = (m * m) as f64;
    let mut forecast = vec![0.0f64; m];
    let mut sum = 0.0f64;
    let mut samples = 0usize;

    for (v, &label) in target.data.iter().enumerate() {
        if label == IGNORE_LABEL {
            continue;
        }
        samples += 1;
        for c in 0..first.classes {
            let obs = if label as usize == c { 1.0 } else { 0.0 };
            for (slot, member) in forecast.iter_mut().zip(members.iter()) {
                *slot = member.get(c, v) as f64;
            }
            let skill = forecast.iter().map(|x| (x - obs).abs()).sum::<f64>() / m as f64;

            forecast.sort_unstable_by(|a, b| a.total_cmp(b));
            // Σ_{i<j} (x_j - x_i) over sorted members.
            let spread: f64 = forecast
                .iter()
                .enumerate()
                .map(|(i, x)| x * (2.0 * i as f64 - (m as f64 - 1.0)))
                .sum();

            sum += skill - spread / m_sq;
        }
    }

    if samples == 0 {
        return Ok(None);
    }
    let terms = samples * first.classes;
    Ok(Some(MetricScore::new(sum / terms as f64, samples)))
}
