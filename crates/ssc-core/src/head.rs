// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Voxel Completion Head
// ─────────────────────────────────────────────────────────────────────
//! Forward pass of the completion head:
//!
//! 1. load the ensemble confidence for the frame,
//! 2. weight the learned queries by it,
//! 3. cross-attend seed voxels and scatter with the mask embedding,
//! 4. self-attend across the dense volume,
//! 5. classify every voxel with the segmentation head.
//!
//! Learned operators sit behind [`VoxelAttention`] and
//! [`SegmentationHead`]; everything else is deterministic and owned here.

use std::sync::Arc;

use ssc_types::{
    ClassVolume, FeatureMatrix, ImageMeta, MultiLevelFeatures, SscConfig, SscError, SscResult,
    VoxelFeatureVolume,
};

use crate::attention::{AttentionGeometry, VoxelAttention};
use crate::completion::{complete_volume, FrameContext, SeedPartition};
use crate::diffusion::diffuse;
use crate::grid::GridIndex;
use crate::positional::LearnedPositionalEncoding;
use crate::proposal::{ConfidenceField, ProposalLoader};
use crate::query::weight_queries;
use crate::store::EnsembleStore;

// ─── Segmentation head ──────────────────────────────────────────────

/// Trait for per-voxel classifiers over the diffused volume.
pub trait SegmentationHead: Send + Sync {
    /// Map `(H, W, Z, D)` features to `(C, H, W, Z)` logits.
    fn forward(&self, volume: &VoxelFeatureVolume) -> SscResult<ClassVolume>;
}

/// Pointwise linear classifier, `logit = W · f + b` per voxel.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSegmentationHead {
    /// `(classes, dim)` row-major.
    weight: FeatureMatrix,
    bias: Vec<f32>,
}

impl LinearSegmentationHead {
    pub fn new(weight: FeatureMatrix, bias: Vec<f32>) -> SscResult<Self> {
        if weight.rows != bias.len() {
            return Err(SscError::Config(format!(
                "classifier has {} weight rows and {} biases",
                weight.rows,
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn classes(&self) -> usize {
        self.weight.rows
    }
}

impl SegmentationHead for LinearSegmentationHead {
    fn forward(&self, volume: &VoxelFeatureVolume) -> SscResult<ClassVolume> {
        if volume.dim != self.weight.dim {
            return Err(SscError::Contract(format!(
                "classifier expects {} channels, volume has {}",
                self.weight.dim, volume.dim
            )));
        }
        let n = volume.shape.num_voxels();
        let classes = self.classes();
        let mut data = vec![0.0f32; classes * n];
        for (v, feat) in volume.data.chunks_exact(volume.dim.max(1)).enumerate().take(n) {
            for c in 0..classes {
                let dot: f32 = self.weight.row(c).iter().zip(feat).map(|(w, f)| w * f).sum();
                data[c * n + v] = dot + self.bias[c];
            }
        }
        ClassVolume::new(classes, volume.shape, data)
    }
}

type SegmentationFn = Box<dyn Fn(&VoxelFeatureVolume) -> SscResult<ClassVolume> + Send + Sync>;

/// Segmentation head delegating to a caller-supplied function.
pub struct ExternalSegmentationHead {
    forward_fn: SegmentationFn,
}

impl ExternalSegmentationHead {
    pub fn new(
        forward_fn: impl Fn(&VoxelFeatureVolume) -> SscResult<ClassVolume> + Send + Sync + 'static,
    ) -> Self {
        Self {
            forward_fn: Box::new(forward_fn),
        }
    }
}

impl SegmentationHead for ExternalSegmentationHead {
    fn forward(&self, volume: &VoxelFeatureVolume) -> SscResult<ClassVolume> {
        (self.forward_fn)(volume)
    }
}

// ─── Learned parameters ─────────────────────────────────────────────

/// Learned tensors owned by the head itself.
#[derive(Debug, Clone)]
pub struct HeadParams {
    /// One row per voxel, `embed_dims` wide.
    pub query_embed: FeatureMatrix,
    /// Shared embedding for masked voxels.
    pub mask_embed: Vec<f32>,
    pub positional: Option<LearnedPositionalEncoding>,
}

impl HeadParams {
    /// Zero-initialised parameters for a grid and feature width.
    pub fn zeros(num_voxels: usize, embed_dims: usize) -> Self {
        Self {
            query_embed: FeatureMatrix::filled(num_voxels, embed_dims, 0.0),
            mask_embed: vec![0.0; embed_dims],
            positional: None,
        }
    }
}

/// External operators the head calls into.
#[derive(Clone)]
pub struct HeadBackends {
    pub ensemble: Arc<dyn EnsembleStore>,
    pub attention: Arc<dyn VoxelAttention>,
    pub segmentation: Arc<dyn SegmentationHead>,
}

// ─── Head ───────────────────────────────────────────────────────────

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// `(n_classes, H, W, Z)` logits.
    pub ssc_logit: ClassVolume,
    pub confidence: ConfidenceField,
}

pub struct VoxelHead {
    config: SscConfig,
    index: GridIndex,
    params: HeadParams,
    positional_table: Option<FeatureMatrix>,
    loader: ProposalLoader,
    attention: Arc<dyn VoxelAttention>,
    segmentation: Arc<dyn SegmentationHead>,
}

impl VoxelHead {
    pub fn new(config: SscConfig, params: HeadParams, backends: HeadBackends) -> SscResult<Self> {
        config.validate()?;
        let index = GridIndex::build(&config.grid)?;
        let n = index.len();
        let d = config.embed_dims;

        if params.query_embed.rows != n || params.query_embed.dim != d {
            return Err(SscError::Config(format!(
                "query embedding is {}x{}, grid needs {n}x{d}",
                params.query_embed.rows, params.query_embed.dim
            )));
        }
        if params.mask_embed.len() != d {
            return Err(SscError::Config(format!(
                "mask embedding has {} channels, expected {d}",
                params.mask_embed.len()
            )));
        }
        let positional_table = match &params.positional {
            Some(pe) if pe.out_dims() != d => {
                return Err(SscError::Config(format!(
                    "positional encoding has {} channels, expected {d}",
                    pe.out_dims()
                )))
            }
            Some(pe) => Some(pe.encode(
                config.positional.row_num_embed,
                config.positional.col_num_embed,
            )?),
            None => None,
        };

        let loader = ProposalLoader::new(backends.ensemble, config.proposal.clone(), index.shape());
        log::info!(
            "voxel head ready: grid {}, {} channels, {} classes",
            index.shape(),
            d,
            config.n_classes
        );

        Ok(Self {
            config,
            index,
            params,
            positional_table,
            loader,
            attention: backends.attention,
            segmentation: backends.segmentation,
        })
    }

    pub fn config(&self) -> &SscConfig {
        &self.config
    }

    pub fn index(&self) -> &GridIndex {
        &self.index
    }

    pub fn geometry(&self) -> AttentionGeometry {
        let g = &self.config.grid;
        AttentionGeometry {
            bev_h: g.bev_h,
            bev_w: g.bev_w,
            bev_z: g.bev_z,
            grid_length: g.grid_length(),
        }
    }

    /// Seed/masked split for a frame.
    ///
    /// With `force_all_seed` every voxel is a seed; otherwise the frame's
    /// proposal mask decides.
    pub fn partition(&self, meta: &ImageMeta) -> SscResult<SeedPartition> {
        let n = self.index.len();
        if self.config.proposal.force_all_seed {
            return Ok(SeedPartition::all_seed(n));
        }
        if meta.proposal.len() != n {
            return Err(SscError::Contract(format!(
                "proposal mask has {} entries for {n} voxels",
                meta.proposal.len()
            )));
        }
        Ok(SeedPartition::from_proposal(&meta.proposal))
    }

    pub fn forward(&self, features: &MultiLevelFeatures, meta: &ImageMeta) -> SscResult<HeadOutput> {
        if let Some(bs) = features.batch_size() {
            if bs != 1 {
                return Err(SscError::Contract(format!(
                    "batch size {bs} unsupported, expected 1"
                )));
            }
        }

        let frame = meta.key();
        let confidence = self.loader.load(&frame)?;
        let queries = weight_queries(&self.params.query_embed, &confidence.confidence)?;
        let partition = self.partition(meta)?;

        let ctx = FrameContext {
            image_features: features,
            image_meta: meta,
            index: &self.index,
            partition: &partition,
            geometry: self.geometry(),
            positional: self.positional_table.as_ref(),
        };
        let seeded = complete_volume(&*self.attention, &ctx, &queries, &self.params.mask_embed)?;
        let diffused = diffuse(&*self.attention, &ctx, seeded)?;
        let ssc_logit = self.segmentation.forward(&diffused)?;

        if ssc_logit.classes != self.config.n_classes || ssc_logit.shape != self.index.shape() {
            return Err(SscError::Contract(format!(
                "segmentation head returned {}x{}, expected {}x{}",
                ssc_logit.classes,
                ssc_logit.shape,
                self.config.n_classes,
                self.index.shape()
            )));
        }

        log::debug!(
            "frame {}/{} forward: {} seeds",
            frame.sequence_id,
            frame.padded_frame(),
            partition.seed().len()
        );
        Ok(HeadOutput {
            ssc_logit,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::PassthroughAttention;
    use crate::store::InMemoryEnsembleStore;
    use ssc_types::{FeatureLevel, FrameKey, GridConfig, GridShape, PositionalConfig};

    const SHAPE: GridShape = GridShape::new(2, 2, 1);

    fn config() -> SscConfig {
        SscConfig {
            grid: GridConfig {
                bev_h: 2,
                bev_w: 2,
                bev_z: 1,
                real_h: 1.0,
                real_w: 1.0,
                scene_size: [1.0, 1.0, 0.5],
                vox_origin: [0.0; 3],
            },
            embed_dims: 2,
            n_classes: 2,
            class_weights: vec![1.0, 1.0],
            positional: PositionalConfig {
                row_num_embed: 2,
                col_num_embed: 2,
            },
            ..SscConfig::default()
        }
    }

    /// Class 1 logit = first channel, class 0 logit = second channel.
    fn classifier() -> Arc<dyn SegmentationHead> {
        let w = FeatureMatrix::new(2, 2, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        Arc::new(LinearSegmentationHead::new(w, vec![0.0, 0.0]).unwrap())
    }

    fn head(store: Arc<InMemoryEnsembleStore>, cfg: SscConfig) -> VoxelHead {
        let mut params = HeadParams::zeros(4, 2);
        params.query_embed = FeatureMatrix::filled(4, 2, 1.0);
        params.mask_embed = vec![-1.0, 5.0];
        let backends = HeadBackends {
            ensemble: store,
            attention: Arc::new(PassthroughAttention),
            segmentation: classifier(),
        };
        VoxelHead::new(cfg, params, backends).unwrap()
    }

    fn meta() -> ImageMeta {
        ImageMeta {
            sequence_id: "00".into(),
            frame_id: "10".into(),
            ..ImageMeta::default()
        }
    }

    fn occupancy_logits(occ: [f32; 4]) -> ClassVolume {
        let mut data = vec![0.0; 4];
        data.extend_from_slice(&occ);
        ClassVolume::new(2, SHAPE, data).unwrap()
    }

    #[test]
    fn test_linear_head() {
        let vol = VoxelFeatureVolume::from_matrix(
            GridShape::new(1, 1, 2),
            FeatureMatrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        )
        .unwrap();
        let w = FeatureMatrix::new(1, 2, vec![1.0, -1.0]).unwrap();
        let out = LinearSegmentationHead::new(w, vec![0.5]).unwrap().forward(&vol).unwrap();
        assert_eq!(out.data, vec![-0.5, -0.5]);
    }

    #[test]
    fn test_forward_weights_queries_by_confidence() {
        let store = Arc::new(InMemoryEnsembleStore::new());
        store.insert(0, FrameKey::new("00", "10"), occupancy_logits([10.0, -10.0, 10.0, -10.0]));
        let h = head(store, config());
        let out = h.forward(&MultiLevelFeatures::default(), &meta()).unwrap();
        assert_eq!(out.confidence.occupied, vec![true, false, true, false]);
        // Passthrough attention: logit for class 0 is the second channel of
        // the weighted query, which is the confidence itself.
        for v in 0..4 {
            let c = out.confidence.confidence[v];
            assert!((out.ssc_logit.get(0, v) - c).abs() < 1e-6);
        }
        assert_eq!(out.ssc_logit.argmax().data.len(), 4);
    }

    #[test]
    fn test_forward_uses_mask_embed_for_masked_voxels() {
        let store = Arc::new(InMemoryEnsembleStore::new());
        store.insert(0, FrameKey::new("00", "10"), occupancy_logits([10.0; 4]));
        let mut cfg = config();
        cfg.proposal.force_all_seed = false;
        let h = head(store, cfg);
        let m = ImageMeta {
            proposal: vec![1, 0, 0, 1],
            ..meta()
        };
        let out = h.forward(&MultiLevelFeatures::default(), &m).unwrap();
        // mask embed [-1, 5] → class 0 logit 5, class 1 logit -1
        assert_eq!(out.ssc_logit.get(0, 1), 5.0);
        assert_eq!(out.ssc_logit.get(1, 2), -1.0);
        assert_eq!(out.ssc_logit.argmax().data, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_forward_missing_proposal_mask() {
        let store = Arc::new(InMemoryEnsembleStore::new());
        store.insert(0, FrameKey::new("00", "10"), occupancy_logits([1.0; 4]));
        let mut cfg = config();
        cfg.proposal.force_all_seed = false;
        let h = head(store, cfg);
        assert!(matches!(
            h.forward(&MultiLevelFeatures::default(), &meta()),
            Err(SscError::Contract(_))
        ));
    }

    #[test]
    fn test_forward_without_ensemble_fails() {
        let h = head(Arc::new(InMemoryEnsembleStore::new()), config());
        assert!(matches!(
            h.forward(&MultiLevelFeatures::default(), &meta()),
            Err(SscError::DataUnavailable { .. })
        ));
    }

    #[test]
    fn test_forward_rejects_batched_features() {
        let store = Arc::new(InMemoryEnsembleStore::new());
        store.insert(0, FrameKey::new("00", "10"), occupancy_logits([1.0; 4]));
        let h = head(store, config());
        let feats = MultiLevelFeatures {
            levels: vec![FeatureLevel {
                shape: vec![2, 1, 2, 1, 1],
                data: vec![0.0; 4],
            }],
        };
        assert!(matches!(
            h.forward(&feats, &meta()),
            Err(SscError::Contract(_))
        ));
    }

    #[test]
    fn test_new_rejects_wrong_embedding_shape() {
        let backends = HeadBackends {
            ensemble: Arc::new(InMemoryEnsembleStore::new()),
            attention: Arc::new(PassthroughAttention),
            segmentation: classifier(),
        };
        let params = HeadParams::zeros(3, 2);
        assert!(matches!(
            VoxelHead::new(config(), params, backends),
            Err(SscError::Config(_))
        ));
    }

    #[test]
    fn test_positional_table_encoded_once() {
        let store = Arc::new(InMemoryEnsembleStore::new());
        store.insert(0, FrameKey::new("00", "10"), occupancy_logits([1.0; 4]));
        let mut params = HeadParams::zeros(4, 2);
        params.positional = Some(LearnedPositionalEncoding::zeros(&config().positional, 1));
        let backends = HeadBackends {
            ensemble: store,
            attention: Arc::new(PassthroughAttention),
            segmentation: classifier(),
        };
        let h = VoxelHead::new(config(), params, backends).unwrap();
        assert_eq!(h.positional_table.as_ref().map(|t| t.rows), Some(4));
        assert!(h.forward(&MultiLevelFeatures::default(), &meta()).is_ok());
    }

    #[test]
    fn test_geometry() {
        let h = head(Arc::new(InMemoryEnsembleStore::new()), config());
        let g = h.geometry();
        assert_eq!((g.bev_h, g.bev_w, g.bev_z), (2, 2, 1));
        assert_eq!(g.grid_length, (0.5, 0.5));
    }
}
