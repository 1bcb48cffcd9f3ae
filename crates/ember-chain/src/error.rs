//! Chain store error types.

use thiserror::Error;

/// Chain store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A block in an inserted batch was rejected. `index` is the position of
    /// the first failing block within the batch; everything before it was
    /// inserted.
    #[error("block {index} of batch (height {height}) rejected: {reason}")]
    Rejected {
        index: usize,
        height: u64,
        reason: String,
    },
}

impl ChainError {
    /// Batch index of the first block that failed.
    pub fn index(&self) -> usize {
        match self {
            ChainError::Rejected { index, .. } => *index,
        }
    }

    /// Height of the first block that failed.
    pub fn height(&self) -> u64 {
        match self {
            ChainError::Rejected { height, .. } => *height,
        }
    }
}

/// Result type for chain store operations.
pub type ChainResult<T> = Result<T, ChainError>;
