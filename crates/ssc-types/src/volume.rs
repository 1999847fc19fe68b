// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Volume and Tensor Value Types
// ─────────────────────────────────────────────────────────────────────
//! Flat, row-major containers for the tensors that cross the kernel:
//! per-class volumes (logits or probabilities), label volumes, query and
//! feature matrices, and the per-frame metadata bundle.
//!
//! Spatial layout everywhere is `(H, W, Z)` with `x` outermost and `z`
//! innermost, so `flat = (x * W + y) * Z + z`. Per-class volumes are
//! channel-major: `data[class * H*W*Z + flat]`.

use serde::{Deserialize, Serialize};

use crate::classes::IGNORE_LABEL;
use crate::error::{SscError, SscResult};

/// Voxel counts along the three grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    pub h: usize,
    pub w: usize,
    pub z: usize,
}

impl GridShape {
    pub const fn new(h: usize, w: usize, z: usize) -> Self {
        Self { h, w, z }
    }

    #[inline]
    pub const fn num_voxels(&self) -> usize {
        self.h * self.w * self.z
    }

    #[inline]
    pub const fn flat_index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.w + y) * self.z + z
    }

    /// Inverse of [`flat_index`](Self::flat_index).
    #[inline]
    pub const fn unflatten(&self, flat: usize) -> (usize, usize, usize) {
        let z = flat % self.z;
        let xy = flat / self.z;
        (xy / self.w, xy % self.w, z)
    }
}

impl std::fmt::Display for GridShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.h, self.w, self.z)
    }
}

// ─── Per-class volumes ──────────────────────────────────────────────

/// Channel-major `(classes, H, W, Z)` volume of logits or probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassVolume {
    pub classes: usize,
    pub shape: GridShape,
    pub data: Vec<f32>,
}

impl ClassVolume {
    pub fn new(classes: usize, shape: GridShape, data: Vec<f32>) -> SscResult<Self> {
        if classes == 0 || classes > u8::MAX as usize {
            return Err(SscError::Contract(format!(
                "class count must be in [1, 255], got {classes}"
            )));
        }
        let expected = classes * shape.num_voxels();
        if data.len() != expected {
            return Err(SscError::Contract(format!(
                "class volume {classes}x{shape} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            classes,
            shape,
            data,
        })
    }

    pub fn zeros(classes: usize, shape: GridShape) -> SscResult<Self> {
        Self::new(classes, shape, vec![0.0; classes * shape.num_voxels()])
    }

    #[inline]
    pub fn num_voxels(&self) -> usize {
        self.shape.num_voxels()
    }

    #[inline]
    pub fn get(&self, class: usize, flat: usize) -> f32 {
        self.data[class * self.num_voxels() + flat]
    }

    pub fn channel(&self, class: usize) -> &[f32] {
        let n = self.num_voxels();
        &self.data[class * n..(class + 1) * n]
    }

    /// Softmax over the class axis, max-subtracted per voxel.
    pub fn softmax(&self) -> ClassVolume {
        let n = self.num_voxels();
        let mut out = vec![0.0f32; self.data.len()];
        for v in 0..n {
            let max = (0..self.classes)
                .map(|c| self.data[c * n + v])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0f64;
            for c in 0..self.classes {
                let e = ((self.data[c * n + v] - max) as f64).exp();
                out[c * n + v] = e as f32;
                denom += e;
            }
            for c in 0..self.classes {
                out[c * n + v] = (out[c * n + v] as f64 / denom) as f32;
            }
        }
        ClassVolume {
            classes: self.classes,
            shape: self.shape,
            data: out,
        }
    }

    /// Per-voxel argmax over the class axis. Ties resolve to the lower class id.
    pub fn argmax(&self) -> LabelVolume {
        let n = self.num_voxels();
        let data = (0..n)
            .map(|v| {
                let mut best = 0usize;
                let mut best_val = self.data[v];
                for c in 1..self.classes {
                    let val = self.data[c * n + v];
                    if val > best_val {
                        best = c;
                        best_val = val;
                    }
                }
                best as u8
            })
            .collect();
        LabelVolume {
            shape: self.shape,
            data,
        }
    }

    /// Elementwise mean of volumes sharing classes and shape.
    pub fn mean(volumes: &[ClassVolume]) -> SscResult<ClassVolume> {
        let first = volumes
            .first()
            .ok_or_else(|| SscError::Contract("mean of zero volumes".to_string()))?;
        let mut acc = vec![0.0f64; first.data.len()];
        for vol in volumes {
            if vol.classes != first.classes || vol.shape != first.shape {
                return Err(SscError::Contract(format!(
                    "volume {}x{} does not match {}x{}",
                    vol.classes, vol.shape, first.classes, first.shape
                )));
            }
            for (a, &x) in acc.iter_mut().zip(vol.data.iter()) {
                *a += x as f64;
            }
        }
        let k = volumes.len() as f64;
        Ok(ClassVolume {
            classes: first.classes,
            shape: first.shape,
            data: acc.into_iter().map(|a| (a / k) as f32).collect(),
        })
    }
}

// ─── Label volumes ──────────────────────────────────────────────────

/// Integer class ids per voxel; [`IGNORE_LABEL`] marks unobserved voxels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVolume {
    pub shape: GridShape,
    pub data: Vec<u8>,
}

impl LabelVolume {
    pub fn new(shape: GridShape, data: Vec<u8>) -> SscResult<Self> {
        if data.len() != shape.num_voxels() {
            return Err(SscError::Contract(format!(
                "label volume {shape} needs {} values, got {}",
                shape.num_voxels(),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn filled(shape: GridShape, label: u8) -> Self {
        Self {
            shape,
            data: vec![label; shape.num_voxels()],
        }
    }

    #[inline]
    pub fn is_valid(&self, flat: usize) -> bool {
        self.data[flat] != IGNORE_LABEL
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&l| l != IGNORE_LABEL).count()
    }
}

// ─── Feature matrices ───────────────────────────────────────────────

/// Row-major `(rows, dim)` matrix of query or feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub rows: usize,
    pub dim: usize,
    pub data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn new(rows: usize, dim: usize, data: Vec<f32>) -> SscResult<Self> {
        if data.len() != rows * dim {
            return Err(SscError::Contract(format!(
                "feature matrix {rows}x{dim} needs {} values, got {}",
                rows * dim,
                data.len()
            )));
        }
        Ok(Self { rows, dim, data })
    }

    pub fn filled(rows: usize, dim: usize, value: f32) -> Self {
        Self {
            rows,
            dim,
            data: vec![value; rows * dim],
        }
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Order-preserving row selection.
    pub fn gather(&self, indices: &[u32]) -> SscResult<FeatureMatrix> {
        let mut data = Vec::with_capacity(indices.len() * self.dim);
        for &i in indices {
            let i = i as usize;
            if i >= self.rows {
                return Err(SscError::Contract(format!(
                    "row index {i} out of range for {} rows",
                    self.rows
                )));
            }
            data.extend_from_slice(self.row(i));
        }
        Ok(FeatureMatrix {
            rows: indices.len(),
            dim: self.dim,
            data,
        })
    }
}

/// Dense `(H, W, Z, D)` voxel feature volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelFeatureVolume {
    pub shape: GridShape,
    pub dim: usize,
    pub data: Vec<f32>,
}

impl VoxelFeatureVolume {
    /// Reinterpret an `(H*W*Z, D)` matrix as a dense volume.
    pub fn from_matrix(shape: GridShape, matrix: FeatureMatrix) -> SscResult<Self> {
        if matrix.rows != shape.num_voxels() {
            return Err(SscError::Contract(format!(
                "expected {} voxel rows for grid {shape}, got {}",
                shape.num_voxels(),
                matrix.rows
            )));
        }
        Ok(Self {
            shape,
            dim: matrix.dim,
            data: matrix.data,
        })
    }

    pub fn into_matrix(self) -> FeatureMatrix {
        FeatureMatrix {
            rows: self.shape.num_voxels(),
            dim: self.dim,
            data: self.data,
        }
    }

    pub fn voxel(&self, x: usize, y: usize, z: usize) -> &[f32] {
        let flat = self.shape.flat_index(x, y, z);
        &self.data[flat * self.dim..(flat + 1) * self.dim]
    }

    /// Permute to channels-first `(D, H, W, Z)` for convolutional heads.
    pub fn to_channels_first(&self) -> Vec<f32> {
        let n = self.shape.num_voxels();
        let mut out = vec![0.0f32; n * self.dim];
        for v in 0..n {
            for d in 0..self.dim {
                out[d * n + v] = self.data[v * self.dim + d];
            }
        }
        out
    }
}

// ─── Frame identity and metadata ────────────────────────────────────

/// Identifies one frame of one driving sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameKey {
    pub sequence_id: String,
    pub frame_id: String,
}

impl FrameKey {
    pub fn new(sequence_id: impl Into<String>, frame_id: impl Into<String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            frame_id: frame_id.into(),
        }
    }

    /// Frame id left-padded with zeros to eight characters.
    pub fn padded_frame(&self) -> String {
        format!("{:0>8}", self.frame_id)
    }

    pub fn npy_name(&self) -> String {
        format!("{}.npy", self.padded_frame())
    }
}

/// Per-frame metadata handed to the head and passed through to the
/// attention capabilities. Camera calibration and anything else the
/// capabilities need live in `extra`, untouched by the kernel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMeta {
    pub frame_id: String,
    pub sequence_id: String,
    /// Initial occupancy hint, one byte per voxel (non-zero = seed).
    #[serde(default)]
    pub proposal: Vec<u8>,
    /// Flattened pseudo point-cloud occupancy volume.
    #[serde(default)]
    pub pseudo_pc: Vec<f32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ImageMeta {
    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.sequence_id.clone(), self.frame_id.clone())
    }
}

/// One level of the camera feature pyramid, `(B, N_cam, C, H, W)`.
#[derive(Debug, Clone, Default)]
pub struct FeatureLevel {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Multi-level camera features. Opaque to the kernel beyond the batch size.
#[derive(Debug, Clone, Default)]
pub struct MultiLevelFeatures {
    pub levels: Vec<FeatureLevel>,
}

impl MultiLevelFeatures {
    pub fn batch_size(&self) -> Option<usize> {
        self.levels.first().and_then(|l| l.shape.first().copied())
    }
}
