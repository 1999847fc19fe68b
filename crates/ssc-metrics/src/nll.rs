// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Negative Log-Likelihood
// ─────────────────────────────────────────────────────────────────────

use ssc_types::{ClassVolume, LabelVolume, SscError, SscResult, IGNORE_LABEL};

use crate::check_pair;
use crate::score::MetricScore;

/// Mean negative log-likelihood of the true class over observed voxels.
///
/// `probs` must already be normalised over the class axis. A zero
/// probability on the true class yields `+inf`; it is counted in
/// `degenerate` and logged, not clamped.
pub fn nll(probs: &ClassVolume, target: &LabelVolume) -> SscResult<Option<MetricScore>> {
    nll_with(probs, target, false)
}

/// As [`nll`], but a zero or non-finite true-class probability is an
/// [`SscError::Numerical`].
pub fn nll_strict(probs: &ClassVolume, target: &LabelVolume) -> SscResult<Option<MetricScore>> {
    nll_with(probs, target, true)
}

fn nll_with(
    probs: &ClassVolume,
    target: &LabelVolume,
    strict: bool,
) -> SscResult<Option<MetricScore>> {
    check_pair(probs, target)?;

    let mut sum = 0.0f64;
    let mut samples = 0usize;
    let mut degenerate = 0usize;

    for (v, &label) in target.data.iter().enumerate() {
        if label == IGNORE_LABEL {
            continue;
        }
        let p = probs.get(label as usize, v) as f64;
        if !(p > 0.0 && p.is_finite()) {
            if strict {
                return Err(SscError::Numerical(format!(
                    "nll: voxel {v} gives probability {p} to its true class {label}"
                )));
            }
            degenerate += 1;
        }
        sum += -p.ln();
        samples += 1;
    }

    if samples == 0 {
        return Ok(None);
    }
    if degenerate > 0 {
        log::warn!(
            "nll: {degenerate} of {samples} observed voxels give zero probability to the true class"
        );
    }

    Ok(Some(MetricScore {
        value: sum / samples as f64,
        samples,
        degenerate,
    }))
}
