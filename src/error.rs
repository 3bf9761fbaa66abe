use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Normalization error: unpairable tool block `{0}`")]
    Normalization(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream length limit ({status}): {message}")]
    UpstreamLength { status: u16, message: String },

    #[error("Stream format error: {0}")]
    StreamFormat(String),

    #[error("Summarization failed: {0}")]
    Summarization(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl AppError {
    // Splits upstream failures into the length-error family that the history
    // engine may retry and everything else.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if crate::proxy::upstream::is_length_error(status, &message) {
            AppError::UpstreamLength { status, message }
        } else {
            AppError::Upstream { status, message }
        }
    }

    pub fn is_length_error(&self) -> bool {
        matches!(self, AppError::UpstreamLength { .. })
    }
}

pub type AppResult<T> = Result<T, AppError>;
