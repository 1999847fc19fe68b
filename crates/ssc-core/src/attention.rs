// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Voxel Attention Interface
// ─────────────────────────────────────────────────────────────────────
//! Attention backend trait, an external adapter, and an identity
//! fallback implementation.
//!
//! The deformable cross- and self-attention networks are heavy learned
//! operators that run outside this crate (a tensor runtime, or the host
//! Python process through the FFI layer). The pipeline only fixes what
//! goes in and what must come out:
//!
//! - `compute_seed_features` receives queries and reference points for
//!   the seed voxels only (aligned with `seed_indices`) and returns one
//!   feature row per seed.
//! - `diffuse_all_features` receives the dense volume flattened to one
//!   row per voxel, plus all reference points, and returns the same
//!   number of rows.

use ssc_types::{FeatureMatrix, ImageMeta, MultiLevelFeatures, SscResult};

use crate::grid::VoxelCoord;

/// Spatial parameters handed to both attention passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionGeometry {
    pub bev_h: usize,
    pub bev_w: usize,
    pub bev_z: usize,
    /// Metres per BEV cell along (h, w).
    pub grid_length: (f64, f64),
}

/// Inputs to one attention call.
#[derive(Debug, Clone, Copy)]
pub struct AttentionRequest<'a> {
    pub image_features: &'a MultiLevelFeatures,
    /// Seed queries (cross pass) or dense voxel features (self pass).
    pub queries: &'a FeatureMatrix,
    /// Reference points aligned with `queries`.
    pub reference_points: &'a [[f64; 3]],
    /// Full lattice, in flat-index order.
    pub voxel_coords: &'a [VoxelCoord],
    pub seed_indices: &'a [u32],
    pub geometry: AttentionGeometry,
    pub positional: Option<&'a FeatureMatrix>,
    pub image_meta: &'a ImageMeta,
    /// Temporal state from the previous frame. Never populated by the
    /// single-frame pipeline.
    pub prev_bev: Option<&'a FeatureMatrix>,
}

/// Trait for voxel attention backends.
pub trait VoxelAttention: Send + Sync {
    /// Cross-attend seed queries to the image features.
    fn compute_seed_features(&self, request: &AttentionRequest<'_>) -> SscResult<FeatureMatrix>;

    /// Self-attend across the full voxel volume.
    fn diffuse_all_features(&self, request: &AttentionRequest<'_>) -> SscResult<FeatureMatrix>;
}

/// Identity backend: returns its queries unchanged.
///
/// Deterministic and model-free; used for testing and for dry runs of
/// the surrounding pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughAttention;

impl VoxelAttention for PassthroughAttention {
    fn compute_seed_features(&self, request: &AttentionRequest<'_>) -> SscResult<FeatureMatrix> {
        Ok(request.queries.clone())
    }

    fn diffuse_all_features(&self, request: &AttentionRequest<'_>) -> SscResult<FeatureMatrix> {
        Ok(request.queries.clone())
    }
}

/// External attention backend that calls two function pointers.
///
/// Used by the PyO3 FFI layer to delegate both passes back to Python
/// (where the transformer weights live) while keeping indexing,
/// weighting, and scattering in Rust.
type AttentionFn = Box<dyn Fn(&AttentionRequest<'_>) -> SscResult<FeatureMatrix> + Send + Sync>;

pub struct ExternalAttention {
    cross_fn: AttentionFn,
    self_fn: AttentionFn,
}

impl ExternalAttention {
    pub fn new(
        cross_fn: impl Fn(&AttentionRequest<'_>) -> SscResult<FeatureMatrix> + Send + Sync + 'static,
        self_fn: impl Fn(&AttentionRequest<'_>) -> SscResult<FeatureMatrix> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cross_fn: Box::new(cross_fn),
            self_fn: Box::new(self_fn),
        }
    }
}

impl VoxelAttention for ExternalAttention {
    fn compute_seed_features(&self, request: &AttentionRequest<'_>) -> SscResult<FeatureMatrix> {
        (self.cross_fn)(request)
    }

    fn diffuse_all_features(&self, request: &AttentionRequest<'_>) -> SscResult<FeatureMatrix> {
        (self.self_fn)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssc_types::SscError;

    fn geometry() -> AttentionGeometry {
        AttentionGeometry {
            bev_h: 2,
            bev_w: 2,
            bev_z: 1,
            grid_length: (0.5, 0.5),
        }
    }

    #[test]
    fn test_passthrough_returns_queries() {
        let feats = MultiLevelFeatures::default();
        let meta = ImageMeta::default();
        let q = FeatureMatrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let refs = [[0.25, 0.25, 0.5], [0.75, 0.75, 0.5]];
        let req = AttentionRequest {
            image_features: &feats,
            queries: &q,
            reference_points: &refs,
            voxel_coords: &[],
            seed_indices: &[0, 3],
            geometry: geometry(),
            positional: None,
            image_meta: &meta,
            prev_bev: None,
        };
        let a = PassthroughAttention;
        assert_eq!(a.compute_seed_features(&req).unwrap(), q);
        assert_eq!(a.diffuse_all_features(&req).unwrap(), q);
    }

    #[test]
    fn test_external_dispatches_by_pass() {
        let a = ExternalAttention::new(
            |r| Ok(FeatureMatrix::filled(r.seed_indices.len(), 1, 1.0)),
            |r| {
                if r.prev_bev.is_some() {
                    return Err(SscError::Contract("unexpected prev_bev".into()));
                }
                Ok(FeatureMatrix::filled(r.queries.rows, 1, 2.0))
            },
        );
        let feats = MultiLevelFeatures::default();
        let meta = ImageMeta::default();
        let q = FeatureMatrix::filled(3, 1, 0.0);
        let req = AttentionRequest {
            image_features: &feats,
            queries: &q,
            reference_points: &[],
            voxel_coords: &[],
            seed_indices: &[1],
            geometry: geometry(),
            positional: None,
            image_meta: &meta,
            prev_bev: None,
        };
        assert_eq!(a.compute_seed_features(&req).unwrap().rows, 1);
        let dense = a.diffuse_all_features(&req).unwrap();
        assert_eq!(dense.rows, 3);
        assert_eq!(dense.data, vec![2.0; 3]);
    }
}
