// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Voxel Grid Indexer
// ─────────────────────────────────────────────────────────────────────
//! Fixed mapping between the voxel lattice and
//! - integer voxel coordinates plus flat index, and
//! - normalised cell-centre reference points in `(0, 1)^3` used by the
//!   deformable attention samplers.
//!
//! Enumeration is x-outer, z-inner, so the flat index of the `i`-th
//! coordinate is `i`. The index is pure: built once per configuration and
//! shared read-only across forward passes.

use ssc_types::{GridConfig, GridShape, SscError, SscResult};

/// Tolerance subtracted before the ceil-division so that spans which are
/// an exact multiple of the voxel size do not round up through float noise.
const SPAN_TOLERANCE: f64 = 1e-6;

/// One voxel of the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoxelCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub flat: u32,
}

/// Voxel coordinates and reference points for one grid.
#[derive(Debug, Clone)]
pub struct GridIndex {
    shape: GridShape,
    voxel_size: f64,
    origin: [f64; 3],
    coords: Vec<VoxelCoord>,
    ref_points: Vec<[f64; 3]>,
}

impl GridIndex {
    /// Build the index, checking the configured dimensions against the
    /// physical scene bounds.
    pub fn build(grid: &GridConfig) -> SscResult<Self> {
        grid.validate()?;
        let shape = grid.shape();
        if shape.num_voxels() > u32::MAX as usize {
            return Err(SscError::Config(format!(
                "voxel grid {shape} exceeds u32 flat indexing"
            )));
        }

        let voxel_size = grid.real_h / grid.bev_h as f64;
        if !(voxel_size.is_finite() && voxel_size > 0.0) {
            return Err(SscError::Config(format!(
                "voxel size must be finite and > 0, got {voxel_size}"
            )));
        }

        let vol_dim = scene_dims(grid.scene_size, voxel_size);
        let configured = [shape.h, shape.w, shape.z];
        if vol_dim != configured {
            return Err(SscError::Config(format!(
                "scene {:?} m at voxel size {voxel_size} m gives {:?} voxels, configured {:?}",
                grid.scene_size, vol_dim, configured
            )));
        }

        let n = shape.num_voxels();
        let mut coords = Vec::with_capacity(n);
        let mut ref_points = Vec::with_capacity(n);
        let (h, w, d) = (shape.h as f64, shape.w as f64, shape.z as f64);
        for x in 0..shape.h {
            for y in 0..shape.w {
                for z in 0..shape.z {
                    coords.push(VoxelCoord {
                        x: x as u32,
                        y: y as u32,
                        z: z as u32,
                        flat: shape.flat_index(x, y, z) as u32,
                    });
                    ref_points.push([
                        (x as f64 + 0.5) / h,
                        (y as f64 + 0.5) / w,
                        (z as f64 + 0.5) / d,
                    ]);
                }
            }
        }

        log::debug!("voxel grid {shape} indexed at {voxel_size} m");

        Ok(Self {
            shape,
            voxel_size,
            origin: grid.vox_origin,
            coords,
            ref_points,
        })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coords(&self) -> &[VoxelCoord] {
        &self.coords
    }

    pub fn reference_points(&self) -> &[[f64; 3]] {
        &self.ref_points
    }

    /// Reference points at the given voxel indices, order preserved.
    pub fn gather_reference_points(&self, indices: &[u32]) -> SscResult<Vec<[f64; 3]>> {
        indices
            .iter()
            .map(|&i| {
                self.ref_points.get(i as usize).copied().ok_or_else(|| {
                    SscError::Contract(format!(
                        "voxel index {i} out of range for {} voxels",
                        self.len()
                    ))
                })
            })
            .collect()
    }

    /// Cell centre of a voxel in lidar coordinates (metres).
    pub fn world_center(&self, coord: &VoxelCoord) -> [f64; 3] {
        let s = self.voxel_size;
        [
            self.origin[0] + (coord.x as f64 + 0.5) * s,
            self.origin[1] + (coord.y as f64 + 0.5) * s,
            self.origin[2] + (coord.z as f64 + 0.5) * s,
        ]
    }
}

/// Per-axis voxel counts covering the scene span.
fn scene_dims(scene_size: [f64; 3], voxel_size: f64) -> [usize; 3] {
    scene_size.map(|span| ((span / voxel_size) - SPAN_TOLERANCE).ceil().max(0.0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_grid() -> GridConfig {
        GridConfig {
            bev_h: 4,
            bev_w: 4,
            bev_z: 2,
            real_h: 4.0,
            real_w: 4.0,
            scene_size: [4.0, 4.0, 2.0],
            vox_origin: [0.0, -2.0, -1.0],
        }
    }

    #[test]
    fn test_small_grid_coordinates() {
        let index = GridIndex::build(&small_grid()).unwrap();
        assert_eq!(index.len(), 32);
        assert_eq!(index.voxel_size(), 1.0);
        let max_x = index.coords().iter().map(|c| c.x).max().unwrap();
        let max_y = index.coords().iter().map(|c| c.y).max().unwrap();
        let max_z = index.coords().iter().map(|c| c.z).max().unwrap();
        assert_eq!((max_x, max_y, max_z), (3, 3, 1));
        assert!(index.coords().iter().all(|c| c.x <= 3 && c.y <= 3 && c.z <= 1));
    }

    #[test]
    fn test_reference_points_are_cell_centres() {
        let index = GridIndex::build(&small_grid()).unwrap();
        let refs = index.reference_points();
        assert!(refs.iter().flatten().all(|&u| u > 0.0 && u < 1.0));
        assert_eq!(refs[0], [0.125, 0.125, 0.25]);
        assert_eq!(refs[31], [0.875, 0.875, 0.75]);
    }

    #[test]
    fn test_flat_index_matches_enumeration() {
        let index = GridIndex::build(&small_grid()).unwrap();
        for (i, c) in index.coords().iter().enumerate() {
            assert_eq!(c.flat as usize, i);
        }
        // z is innermost
        assert_eq!(index.coords()[1], VoxelCoord { x: 0, y: 0, z: 1, flat: 1 });
        assert_eq!(index.coords()[2], VoxelCoord { x: 0, y: 1, z: 0, flat: 2 });
    }

    #[test]
    fn test_default_grid_matches_scene() {
        let index = GridIndex::build(&GridConfig::default()).unwrap();
        assert_eq!(index.len(), 128 * 128 * 16);
        assert!((index.voxel_size() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_dimension_mismatch_is_config_error() {
        let grid = GridConfig {
            bev_z: 3,
            ..small_grid()
        };
        assert!(matches!(GridIndex::build(&grid), Err(SscError::Config(_))));
    }

    #[test]
    fn test_partial_voxel_rounds_up() {
        // 2.5 m of height at 1 m voxels needs 3 voxels.
        let grid = GridConfig {
            scene_size: [4.0, 4.0, 2.5],
            ..small_grid()
        };
        let err = GridIndex::build(&grid).unwrap_err().to_string();
        assert!(err.contains("[4, 4, 3]"));
    }

    #[test]
    fn test_non_square_cells_are_config_error() {
        // 1 m cells along x but 0.5 m along y.
        let grid = GridConfig {
            real_w: 2.0,
            scene_size: [4.0, 2.0, 2.0],
            ..small_grid()
        };
        let err = GridIndex::build(&grid).unwrap_err();
        assert!(matches!(err, SscError::Config(_)));
        assert!(err.to_string().contains("square"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = GridIndex::build(&small_grid()).unwrap();
        let b = GridIndex::build(&small_grid()).unwrap();
        assert_eq!(a.coords(), b.coords());
        let bits = |g: &GridIndex| -> Vec<u64> {
            g.reference_points()
                .iter()
                .flatten()
                .map(|v| v.to_bits())
                .collect()
        };
        assert_eq!(bits(&a), bits(&b));
    }

    #[test]
    fn test_world_center() {
        let index = GridIndex::build(&small_grid()).unwrap();
        let c = index.coords()[0];
        assert_eq!(index.world_center(&c), [0.5, -1.5, -0.5]);
    }

    #[test]
    fn test_gather_reference_points() {
        let index = GridIndex::build(&small_grid()).unwrap();
        let picked = index.gather_reference_points(&[31, 0]).unwrap();
        assert_eq!(picked[0], index.reference_points()[31]);
        assert_eq!(picked[1], index.reference_points()[0]);
        assert!(index.gather_reference_points(&[32]).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any consistent grid yields exactly H*W*Z coordinates whose flat
        /// indices form a permutation of 0..H*W*Z.
        #[test]
        fn flat_index_is_bijection(h in 1usize..10, w in 1usize..10, z in 1usize..6) {
            let size = 0.5;
            let grid = GridConfig {
                bev_h: h,
                bev_w: w,
                bev_z: z,
                real_h: h as f64 * size,
                real_w: w as f64 * size,
                scene_size: [h as f64 * size, w as f64 * size, z as f64 * size],
                vox_origin: [0.0, 0.0, 0.0],
            };
            let index = GridIndex::build(&grid).unwrap();
            prop_assert_eq!(index.len(), h * w * z);
            let mut seen = vec![false; h * w * z];
            for c in index.coords() {
                prop_assert!(!seen[c.flat as usize]);
                seen[c.flat as usize] = true;
            }
            prop_assert!(seen.iter().all(|&s| s));
            prop_assert!(index
                .reference_points()
                .iter()
                .flatten()
                .all(|&u| u > 0.0 && u < 1.0));
        }
    }
}
