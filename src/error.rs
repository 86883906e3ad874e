//! Pipeline error taxonomy.
//!
//! Library functions return `anyhow::Result`. The variants below are carried
//! inside `anyhow::Error` so callers can decide containment with
//! [`ErrorKind::classify`] instead of string matching.

use crate::CameraId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stream cannot be opened or read. The worker reconnects.
    SourceUnavailable,
    /// Single-frame inference error. The frame is skipped.
    DetectorFailure,
    /// Alert write failed. The event is dropped.
    PersistenceFailure,
    /// Malformed startup configuration. Fatal.
    ConfigurationError,
    /// Anything not raised through `PipelineError`.
    Other,
}

impl ErrorKind {
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::SourceUnavailable { .. }) => ErrorKind::SourceUnavailable,
            Some(PipelineError::DetectorFailure { .. }) => ErrorKind::DetectorFailure,
            Some(PipelineError::PersistenceFailure { .. }) => ErrorKind::PersistenceFailure,
            Some(PipelineError::ConfigurationError(_)) => ErrorKind::ConfigurationError,
            None => ErrorKind::Other,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::ConfigurationError)
    }
}

#[derive(Debug)]
pub enum PipelineError {
    SourceUnavailable { camera_id: CameraId, reason: String },
    DetectorFailure { camera_id: CameraId, frame_seq: u64, reason: String },
    PersistenceFailure { reason: String },
    ConfigurationError(String),
}

impl PipelineError {
    pub fn source(camera_id: CameraId, reason: impl Into<String>) -> anyhow::Error {
        PipelineError::SourceUnavailable {
            camera_id,
            reason: reason.into(),
        }
        .into()
    }

    pub fn detector(
        camera_id: CameraId,
        frame_seq: u64,
        reason: impl Into<String>,
    ) -> anyhow::Error {
        PipelineError::DetectorFailure {
            camera_id,
            frame_seq,
            reason: reason.into(),
        }
        .into()
    }

    pub fn persistence(reason: impl Into<String>) -> anyhow::Error {
        PipelineError::PersistenceFailure {
            reason: reason.into(),
        }
        .into()
    }

    pub fn config(reason: impl Into<String>) -> anyhow::Error {
        PipelineError::ConfigurationError(reason.into()).into()
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::SourceUnavailable { camera_id, reason } => {
                write!(f, "source unavailable (camera {}): {}", camera_id, reason)
            }
            PipelineError::DetectorFailure {
                camera_id,
                frame_seq,
                reason,
            } => write!(
                f,
                "detector failure (camera {}, frame {}): {}",
                camera_id, frame_seq, reason
            ),
            PipelineError::PersistenceFailure { reason } => {
                write!(f, "persistence failure: {}", reason)
            }
            PipelineError::ConfigurationError(reason) => {
                write!(f, "configuration error: {}", reason)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_survives_context_layers() {
        let err = Err::<(), _>(PipelineError::source(3, "connection refused"))
            .context("connect camera")
            .unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::SourceUnavailable);
        assert!(!ErrorKind::classify(&err).is_fatal());
    }

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(ErrorKind::classify(&PipelineError::config("bad zone")).is_fatal());
        assert!(!ErrorKind::classify(&PipelineError::persistence("disk full")).is_fatal());
        assert!(!ErrorKind::classify(&PipelineError::detector(0, 7, "nan")).is_fatal());
        assert_eq!(
            ErrorKind::classify(&anyhow::anyhow!("plain")),
            ErrorKind::Other
        );
    }
}
