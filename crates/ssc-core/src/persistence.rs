// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Prediction Persistence
// ─────────────────────────────────────────────────────────────────────
//! Sinks for evaluation outputs.
//!
//! - [`NpyLogitStore`] keeps raw logits at `<root>/<seq>/<frame:08>.npy`
//!   for offline calibration scoring.
//! - [`KittiLabelWriter`] writes argmax ids, mapped back to raw
//!   SemanticKITTI labels, as little-endian `u16` at
//!   `<root>/sequences/<seq>/predictions/<frame>.label`.
//! - [`ScoreStore`] keeps per-frame `[nll, crps, ece]` vectors.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ssc_metrics::{CalibrationSummary, FrameScores};
use ssc_types::classes::to_raw_label;
use ssc_types::{
    ClassVolume, FrameKey, LabelVolume, PersistenceConfig, PredictionFormat, SscError, SscResult,
};

use crate::store::{
    ensure_parent, read_class_volume, read_f64_vector, write_class_volume, write_f64_vector,
};

/// Trait for evaluation-output sinks.
pub trait PredictionSink: Send + Sync {
    fn persist(&self, frame: &FrameKey, logits: &ClassVolume, prediction: &LabelVolume) -> SscResult<()>;
}

/// Build the sink selected by the configuration.
pub fn sink_from_config(config: &PersistenceConfig) -> Arc<dyn PredictionSink> {
    match config.format {
        PredictionFormat::LogitsNpy => Arc::new(NpyLogitStore::new(&config.prediction_root)),
        PredictionFormat::KittiLabel => Arc::new(KittiLabelWriter::new(&config.prediction_root)),
    }
}

// ─── Logits ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NpyLogitStore {
    root: PathBuf,
}

impl NpyLogitStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, frame: &FrameKey) -> PathBuf {
        self.root.join(&frame.sequence_id).join(frame.npy_name())
    }

    pub fn load(&self, frame: &FrameKey) -> SscResult<Option<ClassVolume>> {
        read_class_volume(&self.path(frame))
    }
}

impl PredictionSink for NpyLogitStore {
    fn persist(&self, frame: &FrameKey, logits: &ClassVolume, _prediction: &LabelVolume) -> SscResult<()> {
        let path = self.path(frame);
        write_class_volume(&path, logits)?;
        log::info!("saved logits {}", path.display());
        Ok(())
    }
}

// ─── SemanticKITTI labels ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KittiLabelWriter {
    root: PathBuf,
}

impl KittiLabelWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, frame: &FrameKey) -> PathBuf {
        self.root
            .join("sequences")
            .join(&frame.sequence_id)
            .join("predictions")
            .join(format!("{}.label", frame.frame_id))
    }
}

/// Encode train ids as raw `u16` labels, little-endian.
pub fn encode_labels(prediction: &LabelVolume) -> Vec<u8> {
    prediction
        .data
        .iter()
        .flat_map(|&id| to_raw_label(id).to_le_bytes())
        .collect()
}

impl PredictionSink for KittiLabelWriter {
    fn persist(&self, frame: &FrameKey, _logits: &ClassVolume, prediction: &LabelVolume) -> SscResult<()> {
        let path = self.path(frame);
        ensure_parent(&path)?;
        fs::write(&path, encode_labels(prediction))?;
        log::info!("wrote predictions {}", path.display());
        Ok(())
    }
}

// ─── Scores ─────────────────────────────────────────────────────────

/// Per-frame calibration scores on disk.
#[derive(Debug, Clone)]
pub struct ScoreStore {
    root: PathBuf,
}

impl ScoreStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, frame: &FrameKey) -> PathBuf {
        self.root.join(&frame.sequence_id).join(frame.npy_name())
    }

    /// Write `[nll, crps, ece]`; undefined metrics are stored as NaN.
    pub fn save(&self, frame: &FrameKey, scores: &FrameScores) -> SscResult<()> {
        write_f64_vector(&self.path(frame), &scores.to_array())
    }

    pub fn load(&self, frame: &FrameKey) -> SscResult<Vec<f64>> {
        read_f64_vector(&self.path(frame))
    }

    /// Write the run summary as `<root>/summary.json`.
    pub fn save_summary(&self, summary: &CalibrationSummary) -> SscResult<PathBuf> {
        let path = self.root.join("summary.json");
        ensure_parent(&path)?;
        let json = serde_json::to_string_pretty(summary)
            .map_err(|e| SscError::Io(format!("summary serialization: {e}")))?;
        fs::write(&path, json)?;
        log::info!("wrote calibration summary {}", path.display());
        Ok(path)
    }
}
