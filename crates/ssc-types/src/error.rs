// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for all SSC kernel failures.
#[derive(Error, Debug)]
pub enum SscError {
    /// Grid dimensions disagree with the physical scene bounds, or a
    /// configuration value is out of range.
    #[error("config error: {0}")]
    Config(String),

    /// No ensemble member could be loaded for a frame.
    #[error(
        "data unavailable: no ensemble member found for sequence {sequence_id} \
         frame {frame_id} ({attempted} attempted)"
    )]
    DataUnavailable {
        sequence_id: String,
        frame_id: String,
        attempted: usize,
    },

    /// An external capability or caller broke the shape contract.
    #[error("contract violation: {0}")]
    Contract(String),

    /// Numerical degeneracy (zero probability, NaN/Inf) under strict checks.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// File system failure while reading or writing an artifact.
    #[error("io error: {0}")]
    Io(String),

    /// Malformed or unexpected `.npy` payload.
    #[error("npy error: {0}")]
    Npy(String),
}

impl From<std::io::Error> for SscError {
    fn from(e: std::io::Error) -> Self {
        SscError::Io(e.to_string())
    }
}

pub type SscResult<T> = Result<T, SscError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_unavailable_message() {
        let err = SscError::DataUnavailable {
            sequence_id: "08".into(),
            frame_id: "000123".into(),
            attempted: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("sequence 08"));
        assert!(msg.contains("frame 000123"));
        assert!(msg.contains("5 attempted"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SscError = io.into();
        assert!(matches!(err, SscError::Io(_)));
    }
}
