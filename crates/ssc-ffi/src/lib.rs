// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — PyO3 FFI Bindings
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
// Note: #[deny(unsafe_code)] not applied: PyO3 proc macros generate
// unsafe blocks internally. All hand-written code in this crate is safe.
//! Python-callable wrappers around the SSC kernel.
//!
//! Exposes `SscConfig`, `VoxelGrid`, `ConfidenceLoader`, `VoxelHead` and
//! the `nll` / `crps` / `ece` scoring functions to Python via PyO3.
//!
//! Tensors cross the boundary as flat `list[float]` in row-major order
//! plus an explicit shape; no array library is required on either side.
//!
//! # FFI Safety
//!
//! - GIL acquired via `Python::with_gil` before every Python callback.
//! - Python exceptions inside callbacks become contract violations and
//!   abort the forward pass; they are never replaced by defaults.
//! - No borrowed references escape the GIL lock scope.
//! - All config validated before storage (`SscConfig::validate()`).
//!
//! Install: `pip install -e crates/ssc-ffi` (requires maturin).
//!
//! Usage from Python:
//! ```python
//! from ssc_kernel import SscConfig, ConfidenceLoader
//!
//! loader = ConfidenceLoader(SscConfig(ensemble_root="deepensemble_qpn"))
//! field = loader.load("08", "000000")
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use pyo3::exceptions::{
    PyArithmeticError, PyFileNotFoundError, PyOSError, PyRuntimeError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use ssc_core::{
    AttentionRequest, ConfidenceField, ExternalAttention, ExternalSegmentationHead, GridIndex,
    HeadBackends, HeadParams, NpyEnsembleStore, ProposalLoader, StepDispatcher, VoxelHead,
};
use ssc_types::{
    CalibrationConfig, ClassVolume, EceBinning, EceMode, FeatureMatrix, FrameKey, GridShape, ImageMeta, LabelVolume,
    MultiLevelFeatures, SscConfig, SscError, SscResult, VoxelFeatureVolume, CLASS_WEIGHTS,
    N_CLASSES,
};

// ─── Error mapping ──────────────────────────────────────────────────

fn to_py_err(err: SscError) -> PyErr {
    let msg = err.to_string();
    match err {
        SscError::Config(_) => PyValueError::new_err(msg),
        SscError::DataUnavailable { .. } => PyFileNotFoundError::new_err(msg),
        SscError::Contract(_) => PyRuntimeError::new_err(msg),
        SscError::Numerical(_) => PyArithmeticError::new_err(msg),
        SscError::Io(_) | SscError::Npy(_) => PyOSError::new_err(msg),
    }
}

fn callback_err(stage: &str, err: PyErr) -> SscError {
    log::warn!("{stage} callback raised: {err}");
    SscError::Contract(format!("{stage} callback failed: {err}"))
}

// ─── PySscConfig ────────────────────────────────────────────────────

/// Python-visible configuration for the SSC kernel.
#[pyclass(name = "SscConfig")]
#[derive(Clone)]
struct PySscConfig {
    inner: SscConfig,
}

#[pymethods]
impl PySscConfig {
    #[new]
    #[pyo3(signature = (
        bev_h = 128,
        bev_w = 128,
        bev_z = 16,
        real_h = 51.2,
        real_w = 51.2,
        scene_size = None,
        embed_dims = 128,
        n_classes = 20,
        class_weights = None,
        ensemble_root = "deepensemble_qpn".to_string(),
        ensemble_size = 5,
        force_all_seed = true,
        ece_bins = 15,
        ece_mode = "marginal".to_string(),
        ece_binning = "equal_mass".to_string(),
        ece_norm = 2,
        ece_debias = true,
        strict = false,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        bev_h: usize,
        bev_w: usize,
        bev_z: usize,
        real_h: f64,
        real_w: f64,
        scene_size: Option<(f64, f64, f64)>,
        embed_dims: usize,
        n_classes: usize,
        class_weights: Option<Vec<f64>>,
        ensemble_root: String,
        ensemble_size: usize,
        force_all_seed: bool,
        ece_bins: usize,
        ece_mode: String,
        ece_binning: String,
        ece_norm: u32,
        ece_debias: bool,
        strict: bool,
    ) -> PyResult<Self> {
        let mut config = SscConfig::default();
        config.grid.bev_h = bev_h;
        config.grid.bev_w = bev_w;
        config.grid.bev_z = bev_z;
        config.grid.real_h = real_h;
        config.grid.real_w = real_w;
        if let Some((x, y, z)) = scene_size {
            config.grid.scene_size = [x, y, z];
        }
        config.embed_dims = embed_dims;
        config.n_classes = n_classes;
        config.class_weights = match class_weights {
            Some(w) => w,
            None if n_classes == N_CLASSES => CLASS_WEIGHTS.to_vec(),
            None => vec![1.0; n_classes],
        };
        config.proposal.ensemble_root = PathBuf::from(ensemble_root);
        config.proposal.ensemble_size = ensemble_size;
        config.proposal.force_all_seed = force_all_seed;
        config.calibration.ece_bins = ece_bins;
        config.calibration.ece_mode = parse_ece_mode(&ece_mode)?;
        config.calibration.ece_binning = parse_ece_binning(&ece_binning)?;
        config.calibration.ece_norm = ece_norm;
        config.calibration.ece_debias = ece_debias;
        config.calibration.strict = strict;
        config.proposal.strict = strict;
        config.validate().map_err(to_py_err)?;
        Ok(Self { inner: config })
    }

    /// Construct from JSON string.
    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let config = SscConfig::from_json(json).map_err(to_py_err)?;
        config.validate().map_err(to_py_err)?;
        Ok(Self { inner: config })
    }

    #[getter]
    fn grid_shape(&self) -> (usize, usize, usize) {
        let s = self.inner.grid.shape();
        (s.h, s.w, s.z)
    }

    #[getter]
    fn embed_dims(&self) -> usize {
        self.inner.embed_dims
    }

    #[getter]
    fn n_classes(&self) -> usize {
        self.inner.n_classes
    }

    fn __repr__(&self) -> String {
        let g = &self.inner.grid;
        format!(
            "SscConfig(grid={}x{}x{}, embed_dims={}, n_classes={}, ensemble_size={})",
            g.bev_h,
            g.bev_w,
            g.bev_z,
            self.inner.embed_dims,
            self.inner.n_classes,
            self.inner.proposal.ensemble_size
        )
    }
}

fn parse_ece_mode(mode: &str) -> PyResult<EceMode> {
    match mode {
        "top_label" => Ok(EceMode::TopLabel),
        "marginal" => Ok(EceMode::Marginal),
        other => Err(PyValueError::new_err(format!(
            "ece_mode must be 'top_label' or 'marginal', got {other:?}"
        ))),
    }
}

fn parse_ece_binning(binning: &str) -> PyResult<EceBinning> {
    match binning {
        "equal_width" => Ok(EceBinning::EqualWidth),
        "equal_mass" => Ok(EceBinning::EqualMass),
        other => Err(PyValueError::new_err(format!(
            "ece_binning must be 'equal_width' or 'equal_mass', got {other:?}"
        ))),
    }
}

// ─── VoxelGrid ──────────────────────────────────────────────────────

/// Voxel coordinates and normalised reference points for a grid.
#[pyclass(name = "VoxelGrid")]
struct PyVoxelGrid {
    inner: GridIndex,
}

#[pymethods]
impl PyVoxelGrid {
    #[new]
    #[pyo3(signature = (config = None))]
    fn new(config: Option<PySscConfig>) -> PyResult<Self> {
        let cfg = config.map(|c| c.inner).unwrap_or_default();
        let inner = GridIndex::build(&cfg.grid).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// `(x, y, z, flat_index)` per voxel.
    fn vox_coords(&self) -> Vec<(u32, u32, u32, u32)> {
        self.inner
            .coords()
            .iter()
            .map(|c| (c.x, c.y, c.z, c.flat))
            .collect()
    }

    /// Cell-centre reference points in `(0, 1)^3`.
    fn ref_points(&self) -> Vec<(f64, f64, f64)> {
        self.inner
            .reference_points()
            .iter()
            .map(|p| (p[0], p[1], p[2]))
            .collect()
    }

    #[getter]
    fn shape(&self) -> (usize, usize, usize) {
        let s = self.inner.shape();
        (s.h, s.w, s.z)
    }

    #[getter]
    fn voxel_size(&self) -> f64 {
        self.inner.voxel_size()
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }
}

// ─── ConfidenceField / ConfidenceLoader ─────────────────────────────

/// Python-visible occupancy decision and confidence for one frame.
#[pyclass(name = "ConfidenceField")]
#[derive(Clone)]
struct PyConfidenceField {
    inner: ConfidenceField,
}

#[pymethods]
impl PyConfidenceField {
    #[getter]
    fn occupied(&self) -> Vec<bool> {
        self.inner.occupied.clone()
    }

    #[getter]
    fn confidence(&self) -> Vec<f32> {
        self.inner.confidence.clone()
    }

    #[getter]
    fn occupancy_prob(&self) -> Vec<f32> {
        self.inner.occupancy_prob.clone()
    }

    #[getter]
    fn members_used(&self) -> Vec<usize> {
        self.inner.members_used.clone()
    }

    #[getter]
    fn members_missing(&self) -> Vec<usize> {
        self.inner.members_missing.clone()
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("occupied", &self.inner.occupied)?;
        dict.set_item("confidence", &self.inner.confidence)?;
        dict.set_item("occupancy_prob", &self.inner.occupancy_prob)?;
        dict.set_item("members_used", &self.inner.members_used)?;
        dict.set_item("members_missing", &self.inner.members_missing)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "ConfidenceField(voxels={}, occupied={}, members_used={:?})",
            self.inner.num_voxels(),
            self.inner.occupied_count(),
            self.inner.members_used
        )
    }
}

/// Loads ensemble members from `<ensemble_root>/<member:02>/<seq>/<frame:08>.npy`.
#[pyclass(name = "ConfidenceLoader")]
struct PyConfidenceLoader {
    inner: ProposalLoader,
}

#[pymethods]
impl PyConfidenceLoader {
    #[new]
    #[pyo3(signature = (config = None))]
    fn new(config: Option<PySscConfig>) -> PyResult<Self> {
        let cfg = config.map(|c| c.inner).unwrap_or_default();
        cfg.validate().map_err(to_py_err)?;
        let store = Arc::new(NpyEnsembleStore::new(cfg.proposal.ensemble_root.clone()));
        let inner = ProposalLoader::new(store, cfg.proposal.clone(), cfg.grid.shape());
        Ok(Self { inner })
    }

    fn load(&self, sequence_id: &str, frame_id: &str) -> PyResult<PyConfidenceField> {
        let field = self
            .inner
            .load(&FrameKey::new(sequence_id, frame_id))
            .map_err(to_py_err)?;
        Ok(PyConfidenceField { inner: field })
    }
}

// ─── VoxelHead ──────────────────────────────────────────────────────

/// Build the dict handed to an attention callback.
fn request_dict<'py>(py: Python<'py>, r: &AttentionRequest<'_>) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("queries", &r.queries.data)?;
    dict.set_item("rows", r.queries.rows)?;
    dict.set_item("dim", r.queries.dim)?;
    dict.set_item("reference_points", r.reference_points.to_vec())?;
    dict.set_item("seed_indices", r.seed_indices.to_vec())?;
    dict.set_item("bev_h", r.geometry.bev_h)?;
    dict.set_item("bev_w", r.geometry.bev_w)?;
    dict.set_item("bev_z", r.geometry.bev_z)?;
    dict.set_item("grid_length", r.geometry.grid_length)?;
    dict.set_item("sequence_id", &r.image_meta.sequence_id)?;
    dict.set_item("frame_id", &r.image_meta.frame_id)?;
    Ok(dict)
}

fn call_attention(stage: &str, callback: &PyObject, r: &AttentionRequest<'_>) -> SscResult<FeatureMatrix> {
    Python::with_gil(|py| {
        let dict = request_dict(py, r).map_err(|e| callback_err(stage, e))?;
        let out = callback
            .call1(py, (dict,))
            .map_err(|e| callback_err(stage, e))?;
        let data: Vec<f32> = out.extract(py).map_err(|e| callback_err(stage, e))?;
        let dim = r.queries.dim.max(1);
        if data.len() % dim != 0 {
            return Err(SscError::Contract(format!(
                "{stage} callback returned {} values, not a multiple of {dim}",
                data.len()
            )));
        }
        FeatureMatrix::new(data.len() / dim, r.queries.dim, data)
    })
}

/// Voxel completion head with Python attention and segmentation callbacks.
///
/// Callbacks:
/// - `cross_attention(request: dict) -> list[float]`, one row per seed.
/// - `self_attention(request: dict) -> list[float]`, one row per voxel.
/// - `segmentation_head(features: list[float], dim: int, shape: tuple)
///   -> list[float]` with channels-first `(D, H, W, Z)` input and
///   `(n_classes, H, W, Z)` output.
///
/// Image features stay on the Python side; callbacks close over them.
#[pyclass(name = "VoxelHead")]
struct PyVoxelHead {
    inner: VoxelHead,
    dispatcher: StepDispatcher,
}

#[pymethods]
impl PyVoxelHead {
    #[new]
    #[pyo3(signature = (config, query_embed, mask_embed, cross_attention, self_attention, segmentation_head))]
    fn new(
        config: PySscConfig,
        query_embed: Vec<f32>,
        mask_embed: Vec<f32>,
        cross_attention: PyObject,
        self_attention: PyObject,
        segmentation_head: PyObject,
    ) -> PyResult<Self> {
        let cfg = config.inner;
        let n = cfg.grid.shape().num_voxels();
        let query_embed =
            FeatureMatrix::new(n, cfg.embed_dims, query_embed).map_err(to_py_err)?;
        let params = HeadParams {
            query_embed,
            mask_embed,
            positional: None,
        };

        let attention = ExternalAttention::new(
            move |r| call_attention("cross_attention", &cross_attention, r),
            move |r| call_attention("self_attention", &self_attention, r),
        );
        let n_classes = cfg.n_classes;
        let segmentation = ExternalSegmentationHead::new(move |volume: &VoxelFeatureVolume| {
            Python::with_gil(|py| {
                let s = volume.shape;
                let out = segmentation_head
                    .call1(py, (volume.to_channels_first(), volume.dim, (s.h, s.w, s.z)))
                    .map_err(|e| callback_err("segmentation_head", e))?;
                let data: Vec<f32> = out
                    .extract(py)
                    .map_err(|e| callback_err("segmentation_head", e))?;
                ClassVolume::new(n_classes, s, data)
            })
        });

        let backends = HeadBackends {
            ensemble: Arc::new(NpyEnsembleStore::new(cfg.proposal.ensemble_root.clone())),
            attention: Arc::new(attention),
            segmentation: Arc::new(segmentation),
        };
        let dispatcher = StepDispatcher::new(&cfg);
        let inner = VoxelHead::new(cfg, params, backends).map_err(to_py_err)?;
        Ok(Self { inner, dispatcher })
    }

    /// Run the forward pass for one frame.
    ///
    /// Returns `{"ssc_logit", "shape", "confidence", "occupied"}`.
    #[pyo3(signature = (sequence_id, frame_id, proposal = None))]
    fn forward<'py>(
        &self,
        py: Python<'py>,
        sequence_id: String,
        frame_id: String,
        proposal: Option<Vec<u8>>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let meta = ImageMeta {
            sequence_id,
            frame_id,
            proposal: proposal.unwrap_or_default(),
            ..ImageMeta::default()
        };
        let out = self
            .inner
            .forward(&MultiLevelFeatures::default(), &meta)
            .map_err(to_py_err)?;
        let s = out.ssc_logit.shape;
        let dict = PyDict::new(py);
        dict.set_item("ssc_logit", out.ssc_logit.data)?;
        dict.set_item("shape", (out.ssc_logit.classes, s.h, s.w, s.z))?;
        dict.set_item("confidence", out.confidence.confidence)?;
        dict.set_item("occupied", out.confidence.occupied)?;
        Ok(dict)
    }

    /// Forward then argmax; returns `{"y_pred", "y_true"}`.
    #[pyo3(signature = (sequence_id, frame_id, target, proposal = None))]
    fn eval_step<'py>(
        &self,
        py: Python<'py>,
        sequence_id: String,
        frame_id: String,
        target: Vec<u8>,
        proposal: Option<Vec<u8>>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let meta = ImageMeta {
            sequence_id,
            frame_id,
            proposal: proposal.unwrap_or_default(),
            ..ImageMeta::default()
        };
        let out = self
            .inner
            .forward(&MultiLevelFeatures::default(), &meta)
            .map_err(to_py_err)?;
        let target = LabelVolume::new(out.ssc_logit.shape, target).map_err(to_py_err)?;
        let payload = self
            .dispatcher
            .validation_step(&out.ssc_logit, &target, &meta.key())
            .map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("y_pred", payload.y_pred.data)?;
        dict.set_item("y_true", payload.y_true.data)?;
        Ok(dict)
    }

    #[getter]
    fn num_voxels(&self) -> usize {
        self.inner.index().len()
    }
}

// ─── Scoring functions ──────────────────────────────────────────────

fn volume(data: Vec<f32>, classes: usize, shape: (usize, usize, usize)) -> PyResult<ClassVolume> {
    ClassVolume::new(classes, GridShape::new(shape.0, shape.1, shape.2), data).map_err(to_py_err)
}

fn labels(data: Vec<u8>, shape: (usize, usize, usize)) -> PyResult<LabelVolume> {
    LabelVolume::new(GridShape::new(shape.0, shape.1, shape.2), data).map_err(to_py_err)
}

/// Mean negative log-likelihood of the true class; `None` if every voxel
/// is ignored. With `strict`, a zero true-class probability raises
/// `ArithmeticError` instead of returning `inf`.
#[pyfunction]
#[pyo3(signature = (probs, classes, shape, target, strict = false))]
fn nll(
    probs: Vec<f32>,
    classes: usize,
    shape: (usize, usize, usize),
    target: Vec<u8>,
    strict: bool,
) -> PyResult<Option<f64>> {
    let p = volume(probs, classes, shape)?;
    let t = labels(target, shape)?;
    let score = if strict {
        ssc_metrics::nll_strict(&p, &t)
    } else {
        ssc_metrics::nll(&p, &t)
    };
    Ok(score.map_err(to_py_err)?.map(|s| s.value))
}

/// Ensemble CRPS against the one-hot target.
#[pyfunction]
fn crps(
    members: Vec<Vec<f32>>,
    classes: usize,
    shape: (usize, usize, usize),
    target: Vec<u8>,
) -> PyResult<Option<f64>> {
    let vols = members
        .into_iter()
        .map(|m| volume(m, classes, shape))
        .collect::<PyResult<Vec<_>>>()?;
    let refs: Vec<&ClassVolume> = vols.iter().collect();
    let t = labels(target, shape)?;
    Ok(ssc_metrics::crps_ensemble(&refs, &t)
        .map_err(to_py_err)?
        .map(|s| s.value))
}

/// Expected calibration error. Defaults: marginal, 15 equal-mass bins,
/// debiased L2.
#[pyfunction]
#[pyo3(signature = (
    probs, classes, shape, target,
    num_bins = 15, mode = "marginal", binning = "equal_mass", norm = 2, debias = true,
))]
#[allow(clippy::too_many_arguments)]
fn ece(
    probs: Vec<f32>,
    classes: usize,
    shape: (usize, usize, usize),
    target: Vec<u8>,
    num_bins: usize,
    mode: &str,
    binning: &str,
    norm: u32,
    debias: bool,
) -> PyResult<Option<f64>> {
    let p = volume(probs, classes, shape)?;
    let t = labels(target, shape)?;
    let cfg = CalibrationConfig {
        ece_bins: num_bins,
        ece_mode: parse_ece_mode(mode)?,
        ece_binning: parse_ece_binning(binning)?,
        ece_norm: norm,
        ece_debias: debias,
        strict: false,
    };
    Ok(ssc_metrics::ece(&p, &t, &cfg)
        .map_err(to_py_err)?
        .map(|s| s.value))
}

// ─── Module Registration ────────────────────────────────────────────

/// SSC Kernel: Rust-accelerated voxel completion plumbing.
///
/// - `SscConfig`: configuration
/// - `VoxelGrid`: voxel coordinates and reference points
/// - `ConfidenceLoader` / `ConfidenceField`: ensemble uncertainty
/// - `VoxelHead`: forward pass with Python attention/segmentation
/// - `nll`, `crps`, `ece`: calibration scores
#[pymodule]
fn ssc_kernel(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySscConfig>()?;
    m.add_class::<PyVoxelGrid>()?;
    m.add_class::<PyConfidenceField>()?;
    m.add_class::<PyConfidenceLoader>()?;
    m.add_class::<PyVoxelHead>()?;
    m.add_function(wrap_pyfunction!(nll, m)?)?;
    m.add_function(wrap_pyfunction!(crps, m)?)?;
    m.add_function(wrap_pyfunction!(ece, m)?)?;
    Ok(())
}
