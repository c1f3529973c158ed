//! Error types for stable-audio-rs.

use std::fmt;
use std::path::PathBuf;

use crate::runtime::RuntimeError;
use crate::slots::SlotRole;
use crate::stage::StageKind;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A model or tokenizer file required by the pipeline is absent.
    #[error("{what} not found: {}", .path.display())]
    ResourceMissing { what: &'static str, path: PathBuf },

    /// A stage could not be brought to `Ready`.
    #[error("failed to load {stage}: {source}")]
    Load {
        stage: StageKind,
        #[source]
        source: RuntimeError,
    },

    /// A required tensor role could not be found in a loaded model.
    #[error("{stage}: required tensor slot `{role}` not found")]
    SlotResolution { stage: StageKind, role: SlotRole },

    /// An inter-stage buffer does not fit the consuming tensor.
    #[error("shape mismatch feeding {stage} `{role}`: got {actual} elements, expected {expected}")]
    ShapeMismatch {
        stage: StageKind,
        role: SlotRole,
        expected: usize,
        actual: usize,
    },

    /// The tensor graph reported failure while executing.
    #[error("{stage} inference failed{}: {source}", StepSuffix(*.step))]
    Invocation {
        stage: StageKind,
        step: Option<usize>,
        #[source]
        source: RuntimeError,
    },

    /// A bound tensor has an element type the stage cannot fill or read.
    #[error("{stage}: unsupported element type {ty} for `{role}`")]
    UnsupportedTensorType {
        stage: StageKind,
        role: SlotRole,
        ty: crate::runtime::TensorType,
    },

    /// The caller requested an abort.
    #[error("generation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Audio container error.
    #[error("audio: {0}")]
    Audio(String),

    /// Background manager error.
    #[error("manager: {0}")]
    Manager(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`Error`] used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceMissing,
    LoadFailure,
    SlotResolution,
    ShapeMismatch,
    Invocation,
    Cancelled,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceMissing { .. } => ErrorKind::ResourceMissing,
            Error::Load { .. } | Error::UnsupportedTensorType { .. } => ErrorKind::LoadFailure,
            Error::SlotResolution { .. } => ErrorKind::SlotResolution,
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::Invocation { .. } => ErrorKind::Invocation,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_)
            | Error::Tokenizer(_)
            | Error::Audio(_)
            | Error::Manager(_)
            | Error::Io(_)
            | Error::Json(_) => ErrorKind::Other,
        }
    }

    /// True for user-requested aborts, which should not be reported as failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Slot-resolution failures count as load failures.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LoadFailure | ErrorKind::SlotResolution
        )
    }
}

struct StepSuffix(Option<usize>);

impl fmt::Display for StepSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(step) => write!(f, " at step {step}"),
            None => Ok(()),
        }
    }
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_resolution_counts_as_load_failure() {
        let error = Error::SlotResolution {
            stage: StageKind::Diffuser,
            role: SlotRole::DiffusionTime,
        };
        assert_eq!(error.kind(), ErrorKind::SlotResolution);
        assert!(error.is_load_failure());
        assert!(!error.is_cancelled());
    }

    #[test]
    fn invocation_message_names_step() {
        let error = Error::Invocation {
            stage: StageKind::Diffuser,
            step: Some(3),
            source: RuntimeError::Invocation("boom".into()),
        };
        let message = error.to_string();
        assert!(message.contains("at step 3"), "{message}");
        assert!(message.contains("diffuser"), "{message}");
    }

    #[test]
    fn cancelled_is_distinguished() {
        assert!(Error::Cancelled.is_cancelled());
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
