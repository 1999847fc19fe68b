// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Masked Scatter-Gather
// ─────────────────────────────────────────────────────────────────────
//! Seed/masked voxel partition and the dense volume assembly.
//!
//! Seed voxels receive the features computed by cross-attention from
//! their confidence-weighted queries; every masked voxel receives the
//! shared learned mask embedding. Each voxel is written exactly once.

use ssc_types::{
    FeatureMatrix, ImageMeta, MultiLevelFeatures, SscError, SscResult, VoxelFeatureVolume,
};

use crate::attention::{AttentionGeometry, AttentionRequest, VoxelAttention};
use crate::grid::GridIndex;

// ─── Partition ──────────────────────────────────────────────────────

/// Disjoint cover of the voxel lattice into seed and masked voxels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPartition {
    seed: Vec<u32>,
    masked: Vec<u32>,
    num_voxels: usize,
}

impl SeedPartition {
    /// Every voxel is a seed.
    pub fn all_seed(num_voxels: usize) -> Self {
        Self {
            seed: (0..num_voxels as u32).collect(),
            masked: Vec::new(),
            num_voxels,
        }
    }

    /// Seeds are the voxels with a non-zero proposal entry.
    pub fn from_proposal(proposal: &[u8]) -> Self {
        let (mut seed, mut masked) = (Vec::new(), Vec::new());
        for (i, &p) in proposal.iter().enumerate() {
            if p > 0 {
                seed.push(i as u32);
            } else {
                masked.push(i as u32);
            }
        }
        Self {
            seed,
            masked,
            num_voxels: proposal.len(),
        }
    }

    /// Explicit partition; rejects overlaps, gaps, and out-of-range ids.
    pub fn new(seed: Vec<u32>, masked: Vec<u32>, num_voxels: usize) -> SscResult<Self> {
        let mut hits = vec![0u8; num_voxels];
        for &i in seed.iter().chain(masked.iter()) {
            let slot = hits.get_mut(i as usize).ok_or_else(|| {
                SscError::Contract(format!("voxel {i} out of range for {num_voxels} voxels"))
            })?;
            *slot = slot.saturating_add(1);
        }
        if let Some(i) = hits.iter().position(|&h| h != 1) {
            return Err(SscError::Contract(format!(
                "voxel {i} covered {} times by seed/masked partition",
                hits[i]
            )));
        }
        Ok(Self {
            seed,
            masked,
            num_voxels,
        })
    }

    pub fn seed(&self) -> &[u32] {
        &self.seed
    }

    pub fn masked(&self) -> &[u32] {
        &self.masked
    }

    pub fn num_voxels(&self) -> usize {
        self.num_voxels
    }
}

// ─── Per-frame context ──────────────────────────────────────────────

/// Everything both attention passes see for one frame.
#[derive(Clone, Copy)]
pub struct FrameContext<'a> {
    pub image_features: &'a MultiLevelFeatures,
    pub image_meta: &'a ImageMeta,
    pub index: &'a GridIndex,
    pub partition: &'a SeedPartition,
    pub geometry: AttentionGeometry,
    pub positional: Option<&'a FeatureMatrix>,
}

// ─── Scatter ────────────────────────────────────────────────────────

/// Assemble the dense `(H, W, Z, D)` volume from seed features and the
/// mask embedding.
pub fn scatter_features(
    index: &GridIndex,
    partition: &SeedPartition,
    seed_features: &FeatureMatrix,
    mask_embed: &[f32],
) -> SscResult<VoxelFeatureVolume> {
    let n = index.len();
    if partition.num_voxels() != n {
        return Err(SscError::Contract(format!(
            "partition covers {} voxels, grid has {n}",
            partition.num_voxels()
        )));
    }
    if seed_features.rows != partition.seed().len() {
        return Err(SscError::Contract(format!(
            "cross-attention returned {} rows for {} seed voxels",
            seed_features.rows,
            partition.seed().len()
        )));
    }
    let dim = mask_embed.len();
    if seed_features.dim != dim {
        return Err(SscError::Contract(format!(
            "seed features have {} channels, mask embedding {dim}",
            seed_features.dim
        )));
    }

    let mut out = FeatureMatrix::filled(n, dim, f32::NAN);
    let mut written = vec![false; n];
    let mut write = |voxel: u32, row: &[f32]| -> SscResult<()> {
        let coord = index.coords().get(voxel as usize).ok_or_else(|| {
            SscError::Contract(format!("voxel {voxel} out of range for {n} voxels"))
        })?;
        let flat = coord.flat as usize;
        if std::mem::replace(&mut written[flat], true) {
            return Err(SscError::Contract(format!("voxel {flat} written twice")));
        }
        out.row_mut(flat).copy_from_slice(row);
        Ok(())
    };

    for (row, &voxel) in partition.seed().iter().enumerate() {
        write(voxel, seed_features.row(row))?;
    }
    for &voxel in partition.masked() {
        write(voxel, mask_embed)?;
    }

    if let Some(flat) = written.iter().position(|&w| !w) {
        return Err(SscError::Contract(format!("voxel {flat} never written")));
    }

    VoxelFeatureVolume::from_matrix(index.shape(), out)
}

/// Run cross-attention on the seed voxels and scatter the result.
pub fn complete_volume(
    attention: &dyn VoxelAttention,
    ctx: &FrameContext<'_>,
    queries: &FeatureMatrix,
    mask_embed: &[f32],
) -> SscResult<VoxelFeatureVolume> {
    let seed = ctx.partition.seed();
    let seed_queries = queries.gather(seed)?;
    let seed_refs = ctx.index.gather_reference_points(seed)?;

    let request = AttentionRequest {
        image_features: ctx.image_features,
        queries: &seed_queries,
        reference_points: &seed_refs,
        voxel_coords: ctx.index.coords(),
        seed_indices: seed,
        geometry: ctx.geometry,
        positional: ctx.positional,
        image_meta: ctx.image_meta,
        prev_bev: None,
    };
    let seed_features = attention.compute_seed_features(&request)?;
    log::debug!(
        "cross-attention: {} seed / {} masked voxels",
        seed.len(),
        ctx.partition.masked().len()
    );
    scatter_features(ctx.index, ctx.partition, &seed_features, mask_embed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::PassthroughAttention;
    use ssc_types::GridConfig;

    fn index() -> GridIndex {
        GridIndex::build(&GridConfig {
            bev_h: 2,
            bev_w: 2,
            bev_z: 2,
            real_h: 2.0,
            real_w: 2.0,
            scene_size: [2.0, 2.0, 2.0],
            vox_origin: [0.0; 3],
        })
        .unwrap()
    }

    #[test]
    fn test_all_seed_partition() {
        let p = SeedPartition::all_seed(8);
        assert_eq!(p.seed().len(), 8);
        assert!(p.masked().is_empty());
    }

    #[test]
    fn test_from_proposal() {
        let p = SeedPartition::from_proposal(&[1, 0, 2, 0]);
        assert_eq!(p.seed(), &[0, 2]);
        assert_eq!(p.masked(), &[1, 3]);
    }

    #[test]
    fn test_partition_rejects_overlap_and_gap() {
        assert!(SeedPartition::new(vec![0, 1], vec![1, 2, 3], 4).is_err());
        assert!(SeedPartition::new(vec![0], vec![2, 3], 4).is_err());
        assert!(SeedPartition::new(vec![0, 9], vec![1, 2, 3], 4).is_err());
        assert!(SeedPartition::new(vec![3, 0], vec![1, 2], 4).is_ok());
    }

    #[test]
    fn test_scatter_all_seed_identity() {
        let index = index();
        let p = SeedPartition::all_seed(8);
        let feats = FeatureMatrix::new(8, 1, (0..8).map(|i| i as f32).collect()).unwrap();
        let vol = scatter_features(&index, &p, &feats, &[-1.0]).unwrap();
        assert_eq!(vol.data, (0..8).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_scatter_masked_get_mask_embed() {
        let index = index();
        let p = SeedPartition::new(vec![5, 1], vec![0, 2, 3, 4, 6, 7], 8).unwrap();
        let feats = FeatureMatrix::new(2, 2, vec![5.0, 5.5, 1.0, 1.5]).unwrap();
        let vol = scatter_features(&index, &p, &feats, &[9.0, 9.5]).unwrap();
        assert_eq!(vol.voxel(1, 0, 1), &[5.0, 5.5]);
        assert_eq!(vol.voxel(0, 0, 1), &[1.0, 1.5]);
        for v in [0usize, 2, 3, 4, 6, 7] {
            assert_eq!(&vol.data[v * 2..v * 2 + 2], &[9.0, 9.5]);
        }
        assert!(vol.data.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_scatter_count_mismatch() {
        let index = index();
        let p = SeedPartition::all_seed(8);
        let feats = FeatureMatrix::filled(7, 1, 0.0);
        assert!(matches!(
            scatter_features(&index, &p, &feats, &[0.0]),
            Err(SscError::Contract(_))
        ));
    }

    #[test]
    fn test_scatter_dim_mismatch() {
        let index = index();
        let p = SeedPartition::all_seed(8);
        let feats = FeatureMatrix::filled(8, 2, 0.0);
        assert!(scatter_features(&index, &p, &feats, &[0.0]).is_err());
    }

    #[test]
    fn test_complete_volume_passthrough() {
        let index = index();
        let p = SeedPartition::from_proposal(&[1, 0, 0, 0, 0, 0, 0, 1]);
        let feats = MultiLevelFeatures::default();
        let meta = ImageMeta::default();
        let ctx = FrameContext {
            image_features: &feats,
            image_meta: &meta,
            index: &index,
            partition: &p,
            geometry: AttentionGeometry {
                bev_h: 2,
                bev_w: 2,
                bev_z: 2,
                grid_length: (1.0, 1.0),
            },
            positional: None,
        };
        let queries = FeatureMatrix::new(8, 1, (1..=8).map(|i| i as f32).collect()).unwrap();
        let vol = complete_volume(&PassthroughAttention, &ctx, &queries, &[0.0]).unwrap();
        assert_eq!(vol.shape, index.shape());
        assert_eq!(vol.data, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 8.0]);
    }
}
