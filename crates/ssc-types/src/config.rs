// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Configuration
// ─────────────────────────────────────────────────────────────────────

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::classes::{CLASS_WEIGHTS, N_CLASSES};
use crate::error::{SscError, SscResult};
use crate::volume::GridShape;

/// Relative tolerance when comparing the x and y cell sizes.
const CELL_TOLERANCE: f64 = 1e-9;

/// Voxel lattice and the physical volume it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Voxel count along x (forward). Default: 128.
    pub bev_h: usize,
    /// Voxel count along y (left). Default: 128.
    pub bev_w: usize,
    /// Voxel count along z (up). Default: 16.
    pub bev_z: usize,
    /// Physical extent along x in metres. Default: 51.2.
    pub real_h: f64,
    /// Physical extent along y in metres. Default: 51.2.
    pub real_w: f64,
    /// Scene span (x, y, z) in metres. Default: (51.2, 51.2, 6.4).
    pub scene_size: [f64; 3],
    /// Lower scene corner in lidar coordinates. Default: (0, -25.6, -2).
    pub vox_origin: [f64; 3],
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            bev_h: 128,
            bev_w: 128,
            bev_z: 16,
            real_h: 51.2,
            real_w: 51.2,
            scene_size: [51.2, 51.2, 6.4],
            vox_origin: [0.0, -25.6, -2.0],
        }
    }
}

impl GridConfig {
    pub fn shape(&self) -> GridShape {
        GridShape::new(self.bev_h, self.bev_w, self.bev_z)
    }

    /// Dimensions and extents are positive, and the x and y extents give
    /// the same (square) cell size.
    pub fn validate(&self) -> SscResult<()> {
        if self.bev_h == 0 || self.bev_w == 0 || self.bev_z == 0 {
            return Err(SscError::Config(format!(
                "grid dimensions must be > 0, got {}x{}x{}",
                self.bev_h, self.bev_w, self.bev_z
            )));
        }
        if self.real_h <= 0.0 || self.real_w <= 0.0 || self.scene_size.iter().any(|&s| s <= 0.0) {
            return Err(SscError::Config(format!(
                "physical extents must be > 0, got real=({}, {}) scene={:?}",
                self.real_h, self.real_w, self.scene_size
            )));
        }
        let (gx, gy) = self.grid_length();
        if (gx - gy).abs() > CELL_TOLERANCE * gx.max(gy) {
            return Err(SscError::Config(format!(
                "cells must be square: real_h / bev_h = {gx} m but real_w / bev_w = {gy} m"
            )));
        }
        Ok(())
    }

    /// Cell size along (x, y) handed to the attention capabilities.
    pub fn grid_length(&self) -> (f64, f64) {
        (
            self.real_h / self.bev_h as f64,
            self.real_w / self.bev_w as f64,
        )
    }
}

/// Which loss terms the training step assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossFlags {
    pub ce_ssc: bool,
    pub sem_scal: bool,
    pub geo_scal: bool,
}

impl Default for LossFlags {
    fn default() -> Self {
        Self {
            ce_ssc: true,
            sem_scal: true,
            geo_scal: true,
        }
    }
}

/// Query-proposal ensemble and confidence derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    /// Root of `<root>/<member:02>/<sequence>/<frame:08>.npy`.
    pub ensemble_root: PathBuf,
    /// Number of ensemble members to try. Default: 5.
    pub ensemble_size: usize,
    /// Members hold raw logits; softmax the member mean over classes.
    pub apply_softmax: bool,
    /// Guard keeping `p` inside `[eps, 1 - eps]` before the entropy log.
    pub probability_eps: f64,
    /// Treat every voxel as a seed regardless of `ImageMeta::proposal`.
    pub force_all_seed: bool,
    /// Fail with `SscError::Numerical` on a non-finite occupancy
    /// probability instead of logging it.
    #[serde(default)]
    pub strict: bool,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            ensemble_root: PathBuf::from("deepensemble_qpn"),
            ensemble_size: 5,
            apply_softmax: true,
            probability_eps: 1e-7,
            force_all_seed: true,
            strict: false,
        }
    }
}

/// Learned positional encoding table sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionalConfig {
    pub row_num_embed: usize,
    pub col_num_embed: usize,
}

impl Default for PositionalConfig {
    fn default() -> Self {
        Self {
            row_num_embed: 512,
            col_num_embed: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EceMode {
    /// Bucket the winning-class confidence.
    TopLabel,
    /// Bucket every class probability on its own and aggregate the
    /// per-class errors as `(mean_k ce_k^p)^(1/p)`.
    Marginal,
}

/// How bin edges are placed over the confidences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EceBinning {
    /// Edges at `i / bins`.
    EqualWidth,
    /// Edges at midpoints between sorted confidences so that bins hold
    /// (nearly) the same number of samples.
    EqualMass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Confidence bins. Default: 15.
    pub ece_bins: usize,
    /// Default: marginal.
    pub ece_mode: EceMode,
    /// Default: equal mass.
    pub ece_binning: EceBinning,
    /// Exponent `p` of the per-bin gap, 1 or 2. Default: 2.
    pub ece_norm: u32,
    /// Subtract the per-bin label variance from the squared gap.
    /// Only defined for `ece_norm == 2`. Default: true.
    pub ece_debias: bool,
    /// Fail with `SscError::Numerical` when the true class gets zero
    /// probability instead of reporting an infinite NLL.
    pub strict: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            ece_bins: 15,
            ece_mode: EceMode::Marginal,
            ece_binning: EceBinning::EqualMass,
            ece_norm: 2,
            ece_debias: true,
            strict: false,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> SscResult<()> {
        if self.ece_bins == 0 {
            return Err(SscError::Config("ece_bins must be >= 1".to_string()));
        }
        if !matches!(self.ece_norm, 1 | 2) {
            return Err(SscError::Config(format!(
                "ece_norm must be 1 or 2, got {}",
                self.ece_norm
            )));
        }
        if self.ece_debias && self.ece_norm != 2 {
            return Err(SscError::Config(
                "ece_debias needs ece_norm = 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionFormat {
    /// Raw `(1, C, H, W, Z)` logits for offline calibration scoring.
    LogitsNpy,
    /// Argmax ids mapped to raw SemanticKITTI labels, u16 `.label` files.
    KittiLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub prediction_root: PathBuf,
    pub format: PredictionFormat,
}

/// Runtime configuration for the completion head and its evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SscConfig {
    pub grid: GridConfig,
    /// Query / feature width. Default: 128.
    pub embed_dims: usize,
    /// Semantic classes predicted per voxel. Default: 20.
    pub n_classes: usize,
    pub class_weights: Vec<f64>,
    pub losses: LossFlags,
    pub proposal: ProposalConfig,
    pub positional: PositionalConfig,
    pub calibration: CalibrationConfig,
    /// Save eval predictions when set.
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
}

impl Default for SscConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            embed_dims: 128,
            n_classes: N_CLASSES,
            class_weights: CLASS_WEIGHTS.to_vec(),
            losses: LossFlags::default(),
            proposal: ProposalConfig::default(),
            positional: PositionalConfig::default(),
            calibration: CalibrationConfig::default(),
            persistence: None,
        }
    }
}

impl SscConfig {
    /// Validate configuration parameters.
    ///
    /// Grid/scene consistency is checked by the voxel indexer, which owns
    /// the ceil-division rule.
    pub fn validate(&self) -> SscResult<()> {
        self.grid.validate()?;
        if self.embed_dims == 0 || self.embed_dims % 2 != 0 {
            return Err(SscError::Config(format!(
                "embed_dims must be even and > 0, got {}",
                self.embed_dims
            )));
        }
        if self.n_classes < 2 || self.n_classes > u8::MAX as usize {
            return Err(SscError::Config(format!(
                "n_classes must be in [2, 255], got {}",
                self.n_classes
            )));
        }
        if self.class_weights.len() != self.n_classes {
            return Err(SscError::Config(format!(
                "class_weights has {} entries for {} classes",
                self.class_weights.len(),
                self.n_classes
            )));
        }
        if self.proposal.ensemble_size == 0 {
            return Err(SscError::Config(
                "ensemble_size must be >= 1".to_string(),
            ));
        }
        let eps = self.proposal.probability_eps;
        if !(eps > 0.0 && eps < 0.5) {
            return Err(SscError::Config(format!(
                "probability_eps must be in (0, 0.5), got {eps}"
            )));
        }
        self.calibration.validate()?;
        if self.positional.row_num_embed == 0 || self.positional.col_num_embed == 0 {
            return Err(SscError::Config(
                "positional table sizes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> SscResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SscError::Config(format!("JSON parse error: {e}")))
    }
}

// ─── Occupancy proposal network ─────────────────────────────────────

/// Output resolution of the proposal network relative to its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutScale {
    #[serde(rename = "1_1")]
    Full,
    #[serde(rename = "1_2")]
    Half,
    #[serde(rename = "1_4")]
    Quarter,
    #[serde(rename = "1_8")]
    Eighth,
}

impl OutScale {
    pub fn parse(s: &str) -> SscResult<Self> {
        match s {
            "1_1" => Ok(Self::Full),
            "1_2" => Ok(Self::Half),
            "1_4" => Ok(Self::Quarter),
            "1_8" => Ok(Self::Eighth),
            other => Err(SscError::Config(format!(
                "out_scale must be one of 1_1, 1_2, 1_4, 1_8, got {other:?}"
            ))),
        }
    }

    pub fn divisor(self) -> usize {
        match self {
            Self::Full => 1,
            Self::Half => 2,
            Self::Quarter => 4,
            Self::Eighth => 8,
        }
    }
}

/// Binary occupancy proposal network whose predictions feed the ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalNetConfig {
    pub class_num: usize,
    /// Kept as text so a bad value surfaces as a config error, not a parse panic.
    pub out_scale: String,
    /// Positive-class balance passed to the binary loss. Default: 0.5.
    pub alpha: f64,
    /// Voxel counts of (empty, occupied) over the training set.
    pub class_frequencies: [f64; 2],
    /// Input volume as (W, H, D); H is the channel axis of the 2D encoder.
    pub input_dimensions: [usize; 3],
    /// Ensemble slot this network's eval predictions are written to.
    pub ensemble_member: usize,
    pub ensemble_root: PathBuf,
}

impl Default for ProposalNetConfig {
    fn default() -> Self {
        Self {
            class_num: 2,
            out_scale: "1_2".to_string(),
            alpha: 0.5,
            class_frequencies: [5.41773033e09, 4.03113667e08],
            input_dimensions: [256, 32, 256],
            ensemble_member: 0,
            ensemble_root: PathBuf::from("deepensemble_qpn"),
        }
    }
}

impl ProposalNetConfig {
    pub fn validate(&self) -> SscResult<OutScale> {
        let scale = OutScale::parse(&self.out_scale)?;
        if self.class_num != 2 {
            return Err(SscError::Config(format!(
                "proposal network is binary, class_num must be 2, got {}",
                self.class_num
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SscError::Config(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        if self.class_frequencies.iter().any(|&f| f < 1.0) {
            return Err(SscError::Config(format!(
                "class_frequencies must be >= 1, got {:?}",
                self.class_frequencies
            )));
        }
        let div = scale.divisor();
        if self.input_dimensions.iter().any(|&v| v == 0 || v % div != 0) {
            return Err(SscError::Config(format!(
                "input_dimensions {:?} not divisible by out_scale {}",
                self.input_dimensions, self.out_scale
            )));
        }
        Ok(scale)
    }

    /// Number of values `pseudo_pc` must carry.
    pub fn input_len(&self) -> usize {
        self.input_dimensions.iter().product()
    }

    /// Voxel grid of the network output, `(W, D, H) / scale`.
    pub fn output_shape(&self, scale: OutScale) -> GridShape {
        let [w, h, d] = self.input_dimensions;
        let div = scale.divisor();
        GridShape::new(w / div, d / div, h / div)
    }

    pub fn from_json(json: &str) -> SscResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SscError::Config(format!("JSON parse error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(SscConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_grid_rejected() {
        let mut cfg = SscConfig::default();
        cfg.grid.bev_z = 0;
        assert!(matches!(cfg.validate(), Err(SscError::Config(_))));
    }

    #[test]
    fn test_odd_embed_dims_rejected() {
        let cfg = SscConfig {
            embed_dims: 127,
            ..SscConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_class_weight_count_checked() {
        let cfg = SscConfig {
            class_weights: vec![1.0; 3],
            ..SscConfig::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("class_weights"));
    }

    #[test]
    fn test_eps_bounds() {
        let mut cfg = SscConfig::default();
        cfg.proposal.probability_eps = 0.0;
        assert!(cfg.validate().is_err());
        cfg.proposal.probability_eps = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_modes() {
        let mut cfg = SscConfig::default();
        cfg.calibration.ece_mode = EceMode::TopLabel;
        cfg.persistence = Some(PersistenceConfig {
            prediction_root: PathBuf::from("/tmp/preds"),
            format: PredictionFormat::KittiLabel,
        });
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"top_label\""));
        assert!(json.contains("\"kitti_label\""));
        let back = SscConfig::from_json(&json).unwrap();
        assert_eq!(back.calibration.ece_mode, EceMode::TopLabel);
        assert_eq!(back.grid.bev_z, 16);
    }

    #[test]
    fn test_calibration_defaults_and_checks() {
        let cal = CalibrationConfig::default();
        assert_eq!(cal.ece_mode, EceMode::Marginal);
        assert_eq!(cal.ece_binning, EceBinning::EqualMass);
        assert_eq!((cal.ece_norm, cal.ece_debias, cal.strict), (2, true, false));
        assert!(cal.validate().is_ok());

        let l1_debiased = CalibrationConfig {
            ece_norm: 1,
            ..CalibrationConfig::default()
        };
        assert!(matches!(l1_debiased.validate(), Err(SscError::Config(_))));
        let l3 = CalibrationConfig {
            ece_norm: 3,
            ece_debias: false,
            ..CalibrationConfig::default()
        };
        assert!(l3.validate().is_err());
    }

    #[test]
    fn test_partial_calibration_json_uses_defaults() {
        let cal: CalibrationConfig =
            serde_json::from_str(r#"{"ece_bins": 10, "strict": true}"#).unwrap();
        assert_eq!(cal.ece_bins, 10);
        assert!(cal.strict);
        assert_eq!(cal.ece_binning, EceBinning::EqualMass);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            SscConfig::from_json("{not json"),
            Err(SscError::Config(_))
        ));
    }

    #[test]
    fn test_non_square_cells_rejected() {
        let mut cfg = SscConfig::default();
        cfg.grid.real_w = 25.6;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("square"));
        cfg.grid.bev_w = 64;
        assert!(cfg.grid.validate().is_ok());
    }

    #[test]
    fn test_grid_length() {
        let (gx, gy) = GridConfig::default().grid_length();
        assert!((gx - 0.4).abs() < 1e-12);
        assert!((gy - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_out_scale_parse() {
        assert_eq!(OutScale::parse("1_4").unwrap(), OutScale::Quarter);
        assert_eq!(OutScale::parse("1_8").unwrap().divisor(), 8);
        assert!(matches!(OutScale::parse("1_16"), Err(SscError::Config(_))));
    }

    #[test]
    fn test_proposal_net_validate() {
        let cfg = ProposalNetConfig::default();
        assert_eq!(cfg.validate().unwrap(), OutScale::Half);
        assert_eq!(cfg.input_len(), 256 * 32 * 256);
        assert_eq!(cfg.output_shape(OutScale::Half), GridShape::new(128, 128, 16));

        let bad = ProposalNetConfig {
            out_scale: "2_1".into(),
            ..ProposalNetConfig::default()
        };
        assert!(bad.validate().is_err());

        let multi = ProposalNetConfig {
            class_num: 20,
            ..ProposalNetConfig::default()
        };
        assert!(multi.validate().is_err());
    }
}
