// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Core Pipeline
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Uncertainty-guided voxel completion pipeline for camera-based
//! semantic scene completion.
//!
//! Data flow for one frame:
//!
//! ```text
//! ensemble store ─► ProposalLoader ─► weight_queries ─► complete_volume
//!                                                         │ (cross-attention on seeds,
//!                                                         │  mask embedding elsewhere)
//!                                                         ▼
//!                  StepDispatcher ◄─ SegmentationHead ◄─ diffuse
//! ```
//!
//! # Invariants
//!
//! 1. **Lattice is fixed**: [`GridIndex`] is built once per configuration
//!    and shared read-only; flat index `i` is the `i`-th enumerated voxel.
//!
//! 2. **Occupied voxels are trusted more**: confidence is `≥ 0.5` exactly
//!    where the ensemble argmax says occupied.
//!
//! 3. **Write-once scatter**: every voxel of the dense volume is written
//!    by exactly one of {seed feature, mask embedding}; anything else is a
//!    [`SscError::Contract`](ssc_types::SscError::Contract).
//!
//! 4. **Batch size is 1** on the forward and eval paths.
//!
//! 5. **Missing members are tolerated, an empty ensemble is not**.

pub mod attention;
pub mod completion;
pub mod diffusion;
pub mod evaluation;
pub mod grid;
pub mod head;
pub mod loss;
pub mod persistence;
pub mod positional;
pub mod proposal;
pub mod proposal_net;
pub mod query;
pub mod step;
pub mod store;

pub use attention::{
    AttentionGeometry, AttentionRequest, ExternalAttention, PassthroughAttention, VoxelAttention,
};
pub use completion::{complete_volume, scatter_features, FrameContext, SeedPartition};
pub use diffusion::diffuse;
pub use evaluation::OfflineScorer;
pub use grid::{GridIndex, VoxelCoord};
pub use head::{
    ExternalSegmentationHead, HeadBackends, HeadOutput, HeadParams, LinearSegmentationHead,
    SegmentationHead, VoxelHead,
};
pub use loss::{ExternalLoss, LossInputs, LossKind, LossTerm, WeightedCrossEntropy};
pub use persistence::{
    sink_from_config, KittiLabelWriter, NpyLogitStore, PredictionSink, ScoreStore,
};
pub use positional::LearnedPositionalEncoding;
pub use proposal::{binary_entropy, confidence_from_probs, ConfidenceField, ProposalLoader};
pub use proposal_net::{
    binarize_target, level1_class_weights, pack_bits, ExternalOccupancyNetwork,
    OccupancyNetwork, ProposalNetStep,
};
pub use query::weight_queries;
pub use step::{EvalPayload, LossMap, StepDispatcher, StepMode, StepOutput};
pub use store::{EnsembleStore, ExternalEnsembleStore, InMemoryEnsembleStore, NpyEnsembleStore};
