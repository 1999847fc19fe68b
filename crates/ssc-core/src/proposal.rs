// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Proposal / Uncertainty Loader
// ─────────────────────────────────────────────────────────────────────
//! Turns the stored outputs of an ensemble of occupancy networks into a
//! per-voxel occupancy decision and a confidence weight.
//!
//! For each voxel with ensemble-mean occupancy probability `p`:
//!
//! ```text
//! h(p)       = -p ln p - (1 - p) ln(1 - p)        (nats, ≤ ln 2)
//! occupied   = argmax over {free, occupied}
//! confidence = occupied ? 1 - h/2 : h/2
//! ```
//!
//! Occupied voxels therefore always get confidence ≥ 0.5 and free voxels
//! ≤ 0.5. Missing members are skipped with a warning; a frame with no
//! member at all is a hard [`SscError::DataUnavailable`].

use std::sync::Arc;

use ssc_types::{ClassVolume, FrameKey, GridShape, ProposalConfig, SscError, SscResult};

use crate::store::EnsembleStore;

/// Per-voxel occupancy and confidence for one frame.
#[derive(Debug, Clone)]
pub struct ConfidenceField {
    pub shape: GridShape,
    /// Argmax occupancy decision.
    pub occupied: Vec<bool>,
    /// Ensemble-mean probability of the occupied class.
    pub occupancy_prob: Vec<f32>,
    /// Confidence weight in `[0, 1]`.
    pub confidence: Vec<f32>,
    /// Ensemble members that contributed.
    pub members_used: Vec<usize>,
    /// Ensemble members skipped because they were absent or unreadable.
    pub members_missing: Vec<usize>,
    /// Voxels whose probability was clamped away from 0 or 1 before the
    /// entropy was taken.
    pub guarded: usize,
}

impl ConfidenceField {
    pub fn num_voxels(&self) -> usize {
        self.confidence.len()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.iter().filter(|&&o| o).count()
    }
}

/// Binary entropy in nats.
///
/// `h(0) = h(1) = 0`; non-finite input propagates.
#[inline]
pub fn binary_entropy(p: f64) -> f64 {
    let term = |q: f64| if q > 0.0 { -q * q.ln() } else { 0.0 };
    if !p.is_finite() {
        return p;
    }
    term(p) + term(1.0 - p)
}

/// Confidence derived from the class probabilities of an averaged
/// two-class volume.
///
/// Finite probabilities are clamped to `[eps, 1 - eps]`. Non-finite ones
/// are logged and propagate into the confidence, or fail with
/// [`SscError::Numerical`] when `strict` is set.
pub fn confidence_from_probs(
    probs: &ClassVolume,
    eps: f64,
    strict: bool,
) -> SscResult<ConfidenceField> {
    if probs.classes != 2 {
        return Err(SscError::Contract(format!(
            "occupancy volume must have 2 classes, got {}",
            probs.classes
        )));
    }
    let occupied_mask = probs.argmax();
    let p1 = probs.channel(1);
    let n = probs.num_voxels();

    let mut occupied = Vec::with_capacity(n);
    let mut confidence = Vec::with_capacity(n);
    let mut guarded = 0usize;
    let mut non_finite = 0usize;

    for (v, (&label, &p)) in occupied_mask.data.iter().zip(p1.iter()).enumerate() {
        let p = p as f64;
        let clamped = if p.is_finite() {
            p.clamp(eps, 1.0 - eps)
        } else if strict {
            return Err(SscError::Numerical(format!(
                "voxel {v} has non-finite occupancy probability {p}"
            )));
        } else {
            non_finite += 1;
            p
        };
        if clamped != p && p.is_finite() {
            guarded += 1;
        }
        let h = binary_entropy(clamped);
        let is_occupied = label == 1;
        let c = if is_occupied { 1.0 - 0.5 * h } else { 0.5 * h };
        occupied.push(is_occupied);
        confidence.push(c as f32);
    }

    if guarded > 0 {
        log::debug!("entropy guard clamped {guarded}/{n} voxel probabilities to [{eps}, 1 - {eps}]");
    }
    if non_finite > 0 {
        log::warn!("{non_finite}/{n} voxels have non-finite occupancy probability");
    }

    Ok(ConfidenceField {
        shape: probs.shape,
        occupied,
        occupancy_prob: p1.to_vec(),
        confidence,
        members_used: Vec::new(),
        members_missing: Vec::new(),
        guarded,
    })
}

/// Members loaded for one frame.
#[derive(Debug, Clone)]
pub struct EnsembleMembers {
    pub volumes: Vec<ClassVolume>,
    pub used: Vec<usize>,
    pub missing: Vec<usize>,
}

/// Loads ensemble members for a frame and derives the confidence field.
pub struct ProposalLoader {
    store: Arc<dyn EnsembleStore>,
    config: ProposalConfig,
    shape: GridShape,
}

impl ProposalLoader {
    pub fn new(store: Arc<dyn EnsembleStore>, config: ProposalConfig, shape: GridShape) -> Self {
        Self {
            store,
            config,
            shape,
        }
    }

    pub fn config(&self) -> &ProposalConfig {
        &self.config
    }

    /// Load all available members for `frame`.
    ///
    /// Absent or unreadable members are logged and skipped. Members that
    /// load but disagree on shape are a contract violation.
    pub fn load_members(&self, frame: &FrameKey) -> SscResult<EnsembleMembers> {
        let k = self.config.ensemble_size;
        let mut volumes = Vec::with_capacity(k);
        let mut used = Vec::with_capacity(k);
        let mut missing = Vec::new();

        for member in 0..k {
            match self.store.load(member, frame) {
                Ok(Some(v)) => {
                    if v.classes != 2 || v.shape != self.shape {
                        return Err(SscError::Contract(format!(
                            "ensemble member {member} for {}/{} is {}x{}, expected 2x{}",
                            frame.sequence_id, frame.frame_id, v.classes, v.shape, self.shape
                        )));
                    }
                    volumes.push(v);
                    used.push(member);
                }
                Ok(None) => {
                    log::warn!(
                        "ensemble member {member:02} missing for {}/{}",
                        frame.sequence_id,
                        frame.padded_frame()
                    );
                    missing.push(member);
                }
                Err(e) => {
                    log::warn!(
                        "ensemble member {member:02} unreadable for {}/{}: {e}",
                        frame.sequence_id,
                        frame.padded_frame()
                    );
                    missing.push(member);
                }
            }
        }

        if volumes.is_empty() {
            log::error!(
                "no ensemble member available for {}/{}",
                frame.sequence_id,
                frame.padded_frame()
            );
            return Err(SscError::DataUnavailable {
                sequence_id: frame.sequence_id.clone(),
                frame_id: frame.frame_id.clone(),
                attempted: k,
            });
        }

        Ok(EnsembleMembers {
            volumes,
            used,
            missing,
        })
    }

    /// Ensemble-mean probabilities for `frame`.
    ///
    /// Raw member outputs are averaged first and the softmax is taken
    /// over the mean, unless softmax is disabled in the configuration.
    /// The returned members carry no volumes, only the bookkeeping.
    pub fn mean_probabilities(&self, frame: &FrameKey) -> SscResult<(ClassVolume, EnsembleMembers)> {
        let mut members = self.load_members(frame)?;
        let mean = ClassVolume::mean(&members.volumes)?;
        members.volumes.clear();
        let probs = if self.config.apply_softmax {
            mean.softmax()
        } else {
            mean
        };
        Ok((probs, members))
    }

    /// Occupancy decision and confidence for `frame`.
    pub fn load(&self, frame: &FrameKey) -> SscResult<ConfidenceField> {
        let (probs, members) = self.mean_probabilities(frame)?;
        let mut field =
            confidence_from_probs(&probs, self.config.probability_eps, self.config.strict)?;
        log::debug!(
            "frame {}/{}: {} members, {} occupied voxels",
            frame.sequence_id,
            frame.padded_frame(),
            members.used.len(),
            field.occupied_count()
        );
        field.members_used = members.used;
        field.members_missing = members.missing;
        Ok(field)
    }
}
