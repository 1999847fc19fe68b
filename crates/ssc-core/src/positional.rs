// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Learned Positional Encoding
// ─────────────────────────────────────────────────────────────────────
//! Row/column learned positional embedding.
//!
//! The encoding of cell `(i, j)` is the column embedding of `j`
//! concatenated with the row embedding of `i`, giving `2 · num_feats`
//! channels. Rows of the output are ordered row-major over `(i, j)`.

use ssc_types::{FeatureMatrix, PositionalConfig, SscError, SscResult};

#[derive(Debug, Clone, PartialEq)]
pub struct LearnedPositionalEncoding {
    row_embed: FeatureMatrix,
    col_embed: FeatureMatrix,
}

impl LearnedPositionalEncoding {
    pub fn new(row_embed: FeatureMatrix, col_embed: FeatureMatrix) -> SscResult<Self> {
        if row_embed.dim != col_embed.dim {
            return Err(SscError::Config(format!(
                "row embedding has {} features, column embedding {}",
                row_embed.dim, col_embed.dim
            )));
        }
        Ok(Self {
            row_embed,
            col_embed,
        })
    }

    /// Zero-initialised tables sized from the configuration.
    pub fn zeros(config: &PositionalConfig, num_feats: usize) -> Self {
        Self {
            row_embed: FeatureMatrix::filled(config.row_num_embed, num_feats, 0.0),
            col_embed: FeatureMatrix::filled(config.col_num_embed, num_feats, 0.0),
        }
    }

    pub fn num_feats(&self) -> usize {
        self.row_embed.dim
    }

    /// Channels per encoded cell.
    pub fn out_dims(&self) -> usize {
        2 * self.num_feats()
    }

    /// Encode an `h × w` plane.
    pub fn encode(&self, h: usize, w: usize) -> SscResult<FeatureMatrix> {
        if h > self.row_embed.rows || w > self.col_embed.rows {
            return Err(SscError::Config(format!(
                "positional plane {h}x{w} exceeds embedding tables {}x{}",
                self.row_embed.rows, self.col_embed.rows
            )));
        }
        let f = self.num_feats();
        let mut data = Vec::with_capacity(h * w * 2 * f);
        for i in 0..h {
            for j in 0..w {
                data.extend_from_slice(self.col_embed.row(j));
                data.extend_from_slice(self.row_embed.row(i));
            }
        }
        FeatureMatrix::new(h * w, 2 * f, data)
    }
}
