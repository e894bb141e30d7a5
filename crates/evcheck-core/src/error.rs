use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("event identifier must not be empty")]
    EmptyIdentifier,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("histogram error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
