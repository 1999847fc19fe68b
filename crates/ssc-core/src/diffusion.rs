// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Self-Diffusion
// ─────────────────────────────────────────────────────────────────────
//! Self-attention over the dense voxel volume, propagating information
//! from seed voxels into masked ones. Output keeps the input shape.

use ssc_types::{SscError, SscResult, VoxelFeatureVolume};

use crate::attention::{AttentionRequest, VoxelAttention};
use crate::completion::FrameContext;

pub fn diffuse(
    attention: &dyn VoxelAttention,
    ctx: &FrameContext<'_>,
    volume: VoxelFeatureVolume,
) -> SscResult<VoxelFeatureVolume> {
    let shape = volume.shape;
    let dim = volume.dim;
    let dense = volume.into_matrix();

    let request = AttentionRequest {
        image_features: ctx.image_features,
        queries: &dense,
        reference_points: ctx.index.reference_points(),
        voxel_coords: ctx.index.coords(),
        seed_indices: ctx.partition.seed(),
        geometry: ctx.geometry,
        positional: ctx.positional,
        image_meta: ctx.image_meta,
        prev_bev: None,
    };
    let out = attention.diffuse_all_features(&request)?;

    if out.rows != dense.rows || out.dim != dim {
        return Err(SscError::Contract(format!(
            "self-attention returned {}x{}, expected {}x{dim}",
            out.rows, out.dim, dense.rows
        )));
    }
    log::debug!("self-attention diffused {} voxels", out.rows);
    VoxelFeatureVolume::from_matrix(shape, out)
}
