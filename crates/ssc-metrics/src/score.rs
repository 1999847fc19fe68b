// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Score Types
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

/// One metric evaluated over the observed voxels of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub value: f64,
    /// Observed (non-ignored) voxels that entered the score.
    pub samples: usize,
    /// Terms hitting a numerical edge (zero probability for NLL).
    pub degenerate: usize,
}

impl MetricScore {
    pub fn new(value: f64, samples: usize) -> Self {
        Self {
            value,
            samples,
            degenerate: 0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

/// Calibration scores of one frame. `None` when the frame had no
/// observed voxels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameScores {
    pub nll: Option<f64>,
    pub crps: Option<f64>,
    pub ece: Option<f64>,
}

impl FrameScores {
    /// `[nll, crps, ece]` with undefined entries as NaN.
    pub fn to_array(&self) -> [f64; 3] {
        [
            self.nll.unwrap_or(f64::NAN),
            self.crps.unwrap_or(f64::NAN),
            self.ece.unwrap_or(f64::NAN),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    pub sum: f64,
    pub count: usize,
}

impl RunningMean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Per-metric means over a sequence of frames. Frames where a metric was
/// undefined do not count towards that metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub frames: usize,
    pub nll: RunningMean,
    pub crps: RunningMean,
    pub ece: RunningMean,
}

impl CalibrationSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, scores: &FrameScores) {
        self.frames += 1;
        self.nll.push(scores.nll);
        self.crps.push(scores.crps);
        self.ece.push(scores.ece);
    }

    pub fn means(&self) -> FrameScores {
        FrameScores {
            nll: self.nll.mean(),
            crps: self.crps.mean(),
            ece: self.ece.mean(),
        }
    }
}
