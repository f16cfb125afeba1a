use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure classes a video or unit can end in.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("source unreadable: {path}: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },
    #[error("decode failed at frame {frame}: {reason}")]
    Decode { frame: usize, reason: String },
    #[error("failed to write frame {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("detector unavailable: {0}")]
    Detector(String),
    #[error("unit exceeded its deadline of {0:?}")]
    Timeout(Duration),
    #[error("unit cancelled after its deadline")]
    Cancelled,
    #[error("unit panicked: {0}")]
    Panicked(String),
    #[error("worker pool is gone")]
    WorkerGone,
}

impl ExtractError {
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable label used in the run report.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnreadable { .. } => "source_unreadable",
            Self::Decode { .. } => "decode",
            Self::Write { .. } => "write",
            Self::Detector(_) => "detector",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
            Self::WorkerGone => "worker_gone",
        }
    }
}

/// Classify an arbitrary unit error for reporting.
pub fn failure_kind(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<ExtractError>()
        .map(ExtractError::kind)
        .unwrap_or("unit")
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ExtractError>(), Some(ExtractError::Cancelled))
}
