// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Type definitions, configuration, and error hierarchy for the
//! semantic scene completion kernel.

pub mod classes;
pub mod config;
pub mod error;
pub mod volume;

pub use classes::{CLASS_NAMES, CLASS_WEIGHTS, IGNORE_LABEL, N_CLASSES};
pub use config::{
    CalibrationConfig, EceBinning, EceMode, GridConfig, LossFlags, OutScale, PersistenceConfig,
    PositionalConfig, PredictionFormat, ProposalConfig, ProposalNetConfig, SscConfig,
};
pub use error::{SscError, SscResult};
pub use volume::{
    ClassVolume, FeatureLevel, FeatureMatrix, FrameKey, GridShape, ImageMeta, LabelVolume,
    MultiLevelFeatures, VoxelFeatureVolume,
};
