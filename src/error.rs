use thiserror::Error;

/// Failures raised by the sparse attention core.
///
/// Every variant signals a construction bug in the caller's data or model
/// (never a transient condition), so none of them are worth retrying.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{op}: shape mismatch, expected {expected} but got {actual}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        actual: String,
    },

    #[error("{heads} heads but {adjacencies} adjacency matrices")]
    HeadCountMismatch { heads: usize, adjacencies: usize },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("{op}: index {index} out of range for {bound} nodes")]
    IndexOutOfRange {
        op: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("invalid batch index: {0}")]
    InvalidBatchIndex(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(op: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
