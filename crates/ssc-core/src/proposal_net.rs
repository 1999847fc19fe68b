// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Occupancy Proposal Network Step
// ─────────────────────────────────────────────────────────────────────
//! Step logic of the coarse binary occupancy network whose eval outputs
//! become one member of the ensemble read by the proposal loader.
//!
//! The convolutional network itself is an external collaborator behind
//! [`OccupancyNetwork`]. This module owns target binarisation, the
//! level-1 class weights, input/output contracts, and where eval logits
//! are written.

use std::sync::Arc;

use ssc_types::{
    ClassVolume, FrameKey, GridShape, ImageMeta, LabelVolume, OutScale, ProposalNetConfig,
    SscError, SscResult, IGNORE_LABEL,
};

use crate::loss::{LossInputs, LossKind, LossTerm};
use crate::step::{EvalPayload, LossMap};
use crate::store::{EnsembleStore, NpyEnsembleStore};

/// Trait for the occupancy network forward pass.
pub trait OccupancyNetwork: Send + Sync {
    /// `input` is the pseudo point cloud laid out as `dims` (row-major).
    /// Returns `(2, W', D', H')` logits at the configured output scale.
    fn forward(&self, input: &[f32], dims: [usize; 3]) -> SscResult<ClassVolume>;
}

type OccupancyFn = Box<dyn Fn(&[f32], [usize; 3]) -> SscResult<ClassVolume> + Send + Sync>;

/// Occupancy network delegating to a caller-supplied function.
pub struct ExternalOccupancyNetwork {
    forward_fn: OccupancyFn,
}

impl ExternalOccupancyNetwork {
    pub fn new(
        forward_fn: impl Fn(&[f32], [usize; 3]) -> SscResult<ClassVolume> + Send + Sync + 'static,
    ) -> Self {
        Self {
            forward_fn: Box::new(forward_fn),
        }
    }
}

impl OccupancyNetwork for ExternalOccupancyNetwork {
    fn forward(&self, input: &[f32], dims: [usize; 3]) -> SscResult<ClassVolume> {
        (self.forward_fn)(input, dims)
    }
}

/// Map semantic labels to {0 empty, 1 occupied}, keeping the ignore label.
pub fn binarize_target(target: &LabelVolume) -> LabelVolume {
    LabelVolume {
        shape: target.shape,
        data: target
            .data
            .iter()
            .map(|&l| if l == 0 || l == IGNORE_LABEL { l } else { 1 })
            .collect(),
    }
}

/// `1 / ln(freq + 0.001)` per class.
pub fn level1_class_weights(frequencies: [f64; 2]) -> [f64; 2] {
    frequencies.map(|f| 1.0 / (f + 0.001).ln())
}

/// Pack a boolean mask 8:1, most significant bit first.
///
/// A trailing partial byte is zero-padded.
pub fn pack_bits(mask: &[bool]) -> Vec<u8> {
    mask.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &b)| acc | ((b as u8) << (7 - i)))
        })
        .collect()
}

/// Inverse of [`pack_bits`] for the first `len` entries.
pub fn unpack_bits(packed: &[u8], len: usize) -> Vec<bool> {
    (0..len)
        .map(|i| packed.get(i / 8).is_some_and(|&byte| byte & (0x80 >> (i % 8)) != 0))
        .collect()
}

pub struct ProposalNetStep {
    config: ProposalNetConfig,
    scale: OutScale,
    class_weights: [f64; 2],
    network: Arc<dyn OccupancyNetwork>,
    loss: Arc<dyn LossTerm>,
    ensemble: Arc<dyn EnsembleStore>,
}

impl ProposalNetStep {
    pub fn new(
        config: ProposalNetConfig,
        network: Arc<dyn OccupancyNetwork>,
        loss: Arc<dyn LossTerm>,
        ensemble: Arc<dyn EnsembleStore>,
    ) -> SscResult<Self> {
        let scale = config.validate()?;
        let class_weights = level1_class_weights(config.class_frequencies);
        Ok(Self {
            config,
            scale,
            class_weights,
            network,
            loss,
            ensemble,
        })
    }

    /// Write eval logits as `.npy` files under `config.ensemble_root`.
    pub fn with_npy_store(
        config: ProposalNetConfig,
        network: Arc<dyn OccupancyNetwork>,
        loss: Arc<dyn LossTerm>,
    ) -> SscResult<Self> {
        let ensemble = Arc::new(NpyEnsembleStore::new(config.ensemble_root.clone()));
        Self::new(config, network, loss, ensemble)
    }

    pub fn scale(&self) -> OutScale {
        self.scale
    }

    pub fn class_weights(&self) -> [f64; 2] {
        self.class_weights
    }

    pub fn output_shape(&self) -> GridShape {
        self.config.output_shape(self.scale)
    }

    /// Run the network on the frame's pseudo point cloud.
    pub fn forward(&self, meta: &ImageMeta) -> SscResult<ClassVolume> {
        let expected = self.config.input_len();
        if meta.pseudo_pc.len() != expected {
            return Err(SscError::Contract(format!(
                "pseudo_pc has {} values, network input needs {expected}",
                meta.pseudo_pc.len()
            )));
        }
        let [w, h, d] = self.config.input_dimensions;
        let logits = self.network.forward(&meta.pseudo_pc, [w, d, h])?;
        let shape = self.output_shape();
        if logits.classes != 2 || logits.shape != shape {
            return Err(SscError::Contract(format!(
                "occupancy network returned {}x{}, expected 2x{shape}",
                logits.classes, logits.shape
            )));
        }
        Ok(logits)
    }

    fn check_target(&self, target: &LabelVolume) -> SscResult<()> {
        let shape = self.output_shape();
        if target.shape != shape {
            return Err(SscError::Contract(format!(
                "target grid {} does not match network output {shape}",
                target.shape
            )));
        }
        Ok(())
    }

    pub fn training_step(&self, meta: &ImageMeta, target: &LabelVolume) -> SscResult<LossMap> {
        self.check_target(target)?;
        let logits = self.forward(meta)?;
        let target = binarize_target(target);
        let value = self.loss.compute(&LossInputs {
            prediction: &logits,
            target: &target,
            class_weights: &self.class_weights,
            alpha: Some(self.config.alpha),
        })?;
        let mut losses = LossMap::new();
        losses.insert(LossKind::Occupancy.key(), value);
        Ok(losses)
    }

    /// Persist raw logits to this network's ensemble slot and return the
    /// binary prediction with its binarised ground truth.
    pub fn test_step(&self, meta: &ImageMeta, target: &LabelVolume) -> SscResult<EvalPayload> {
        self.check_target(target)?;
        let logits = self.forward(meta)?;
        let frame = FrameKey::new(format!("{:0>2}", meta.sequence_id), meta.frame_id.clone());
        self.ensemble
            .save(self.config.ensemble_member, &frame, &logits)?;
        log::info!(
            "saved occupancy logits for {}/{} to member {:02}",
            frame.sequence_id,
            frame.padded_frame(),
            self.config.ensemble_member
        );
        Ok(EvalPayload {
            y_pred: logits.argmax(),
            y_true: binarize_target(target),
        })
    }
}
