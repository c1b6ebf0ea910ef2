#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown source handler '{0}'")]
    UnknownHandler(String),

    #[error("failed to open source {source_name}: {reason}")]
    SourceOpen { source_name: String, reason: String },

    #[error("source {0} is not available")]
    SourceUnavailable(String),

    #[error(transparent)]
    Store(#[from] redis::RedisError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        EngineError::InvalidConfig(message.into())
    }

    pub fn source_open(source: impl ToString, reason: impl ToString) -> Self {
        EngineError::SourceOpen {
            source_name: source.to_string(),
            reason: reason.to_string(),
        }
    }
}
