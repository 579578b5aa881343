//! Pipeline error taxonomy
//!
//! Every component error converts into [`PipelineError`]; the worker loop
//! only looks at [`ErrorKind`] to decide what happens to the job.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientInfra,
    RateLimited,
    CorruptObject,
    BackendUnavailable,
    /// Retrying cannot succeed (repository gone, malformed payload)
    Permanent,
    Fatal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// Host quota exhausted; `reset_at` is epoch milliseconds
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: i64 },

    #[error("corrupt object {object}: {reason}")]
    CorruptObject { object: String, reason: String },

    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TransientInfra(_) => ErrorKind::TransientInfra,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::CorruptObject { .. } => ErrorKind::CorruptObject,
            PipelineError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            PipelineError::Permanent(_) => ErrorKind::Permanent,
            PipelineError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        PipelineError::TransientInfra(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        PipelineError::Fatal(msg.into())
    }

    /// Classify a filesystem error; running out of disk stops the worker
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        if is_disk_exhausted(err) {
            PipelineError::Fatal(format!("{context}: {err}"))
        } else {
            PipelineError::TransientInfra(format!("{context}: {err}"))
        }
    }
}

pub fn is_disk_exhausted(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            PipelineError::RateLimited { reset_at: 5 }.kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(PipelineError::fatal("disk").kind(), ErrorKind::Fatal);
        assert_eq!(
            PipelineError::Permanent("gone".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_io_classification() {
        let full = std::io::Error::from(std::io::ErrorKind::StorageFull);
        assert_eq!(PipelineError::from_io("write", &full).kind(), ErrorKind::Fatal);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            PipelineError::from_io("write", &denied).kind(),
            ErrorKind::TransientInfra
        );
    }
}
