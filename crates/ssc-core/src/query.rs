// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Query Weighting
// ─────────────────────────────────────────────────────────────────────
//! Scales the learned per-voxel query embedding by the proposal
//! confidence: `query[i] = confidence[i] · embedding[i]`.

use ssc_types::{FeatureMatrix, SscError, SscResult};

/// Confidence-weighted queries, one row per voxel.
///
/// The embedding is not modified; a new matrix is returned.
pub fn weight_queries(embedding: &FeatureMatrix, confidence: &[f32]) -> SscResult<FeatureMatrix> {
    if embedding.rows != confidence.len() {
        return Err(SscError::Contract(format!(
            "query embedding has {} rows, confidence covers {} voxels",
            embedding.rows,
            confidence.len()
        )));
    }
    let dim = embedding.dim;
    let mut data = Vec::with_capacity(embedding.data.len());
    for (row, &c) in embedding.data.chunks_exact(dim.max(1)).zip(confidence) {
        data.extend(row.iter().map(|&e| e * c));
    }
    FeatureMatrix::new(embedding.rows, dim, data)
}
