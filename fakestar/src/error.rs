use std::path::PathBuf;
use thiserror::Error;

use crate::batch::BatchKey;

/// Errors produced by the artificial star pipeline.
#[derive(Error, Debug)]
pub enum FakeStarError {
    /// Missing input columns, invalid band selection or bad run settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The generator could not produce a catalog under the requested policy.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// A batch has no usable output yet; retried by the next resume run.
    #[error("batch {key} incomplete: {reason}")]
    IncompleteBatch {
        /// Batch that has not completed.
        key: BatchKey,
        /// Why it is considered incomplete.
        reason: String,
    },

    /// A detection output row could not be parsed; the whole file is discarded.
    #[error("malformed record in {} line {line}: {reason}", path.display())]
    MalformedRecord {
        /// Offending file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong with the row.
        reason: String,
    },

    /// The worker pool could not be started or stopped accepting jobs.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FakeStarError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        FakeStarError::Configuration(msg.into())
    }

    pub(crate) fn sampling(msg: impl Into<String>) -> Self {
        FakeStarError::Sampling(msg.into())
    }

    /// True for failures that a later resume run may fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FakeStarError::IncompleteBatch { .. } | FakeStarError::MalformedRecord { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FakeStarError>;
