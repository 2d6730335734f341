use thiserror::Error;

use super::types::Stage;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while opening or driving a protocol session
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("no handler for scheme '{0}'")]
    NoHandler(String),

    #[error("'{scheme}:' scheme does not support the {method} method")]
    UnsupportedMethod { scheme: String, method: String },

    #[error("{scheme} transport error: {source}")]
    Transport {
        scheme: String,
        #[source]
        source: BoxError,
    },

    #[error("{operation} is not valid in stage {stage}")]
    InvalidStage {
        operation: &'static str,
        stage: Stage,
    },
}

impl AccessError {
    /// Wrap any lower-level failure as a transport error for `scheme`.
    pub fn transport(scheme: &str, source: impl Into<BoxError>) -> Self {
        AccessError::Transport {
            scheme: scheme.to_string(),
            source: source.into(),
        }
    }

    /// Failures detected before any connection was attempted
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            AccessError::Malformed(_)
                | AccessError::InvalidProxy(_)
                | AccessError::NoHandler(_)
                | AccessError::UnsupportedMethod { .. }
        )
    }
}
