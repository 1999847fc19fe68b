// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Offline Calibration Scoring
// ─────────────────────────────────────────────────────────────────────
//! Scores saved ensemble predictions against ground truth after the
//! evaluation run, outside the forward path.

use std::sync::Arc;

use parking_lot::Mutex;

use ssc_metrics::{score_frame, CalibrationSummary, FrameScores};
use ssc_types::{CalibrationConfig, ClassVolume, FrameKey, LabelVolume, SscError, SscResult};

use crate::persistence::ScoreStore;
use crate::store::EnsembleStore;

/// Ensemble calibration scorer with a running summary.
///
/// Thread-safe: the summary is guarded by a `parking_lot::Mutex`.
pub struct OfflineScorer {
    store: Arc<dyn EnsembleStore>,
    members: usize,
    config: CalibrationConfig,
    scores: Option<ScoreStore>,
    summary: Mutex<CalibrationSummary>,
}

impl OfflineScorer {
    pub fn new(store: Arc<dyn EnsembleStore>, members: usize, config: CalibrationConfig) -> SscResult<Self> {
        if members == 0 {
            return Err(SscError::Config("offline scorer needs >= 1 member".into()));
        }
        config.validate()?;
        Ok(Self {
            store,
            members,
            config,
            scores: None,
            summary: Mutex::new(CalibrationSummary::new()),
        })
    }

    /// Also write each frame's scores to `store`.
    pub fn with_score_store(mut self, store: ScoreStore) -> Self {
        self.scores = Some(store);
        self
    }

    /// Softmaxed member volumes available for `frame`.
    ///
    /// Each member is softmaxed on its own, so NLL and ECE score the mean
    /// of member distributions and CRPS sees every member. This differs
    /// from [`ProposalLoader`](crate::proposal::ProposalLoader), which
    /// softmaxes the mean of raw member outputs; the two agree only when
    /// members agree.
    pub fn member_probabilities(&self, frame: &FrameKey) -> SscResult<Vec<ClassVolume>> {
        let mut probs = Vec::with_capacity(self.members);
        for member in 0..self.members {
            match self.store.load(member, frame) {
                Ok(Some(logits)) => probs.push(logits.softmax()),
                Ok(None) => log::warn!(
                    "no saved prediction from member {member:02} for {}/{}",
                    frame.sequence_id,
                    frame.padded_frame()
                ),
                Err(e) => log::warn!(
                    "unreadable prediction from member {member:02} for {}/{}: {e}",
                    frame.sequence_id,
                    frame.padded_frame()
                ),
            }
        }
        if probs.is_empty() {
            return Err(SscError::DataUnavailable {
                sequence_id: frame.sequence_id.clone(),
                frame_id: frame.frame_id.clone(),
                attempted: self.members,
            });
        }
        Ok(probs)
    }

    /// Score one frame and fold it into the running summary.
    pub fn score(&self, frame: &FrameKey, target: &LabelVolume) -> SscResult<FrameScores> {
        let probs = self.member_probabilities(frame)?;
        let scores = score_frame(&probs, target, &self.config)?;
        if let Some(store) = &self.scores {
            store.save(frame, &scores)?;
        }
        self.summary.lock().add(&scores);
        log::debug!(
            "frame {}/{}: nll={:?} crps={:?} ece={:?}",
            frame.sequence_id,
            frame.padded_frame(),
            scores.nll,
            scores.crps,
            scores.ece
        );
        Ok(scores)
    }

    pub fn summary(&self) -> CalibrationSummary {
        self.summary.lock().clone()
    }

    pub fn reset(&self) {
        *self.summary.lock() = CalibrationSummary::new();
    }
}
