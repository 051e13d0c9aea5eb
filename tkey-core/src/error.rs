//! Error types for configuration loading and token construction.

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config entry '{0}' is not a JSON object")]
    NotAnObject(String),

    #[error("identity '{key}' is missing field '{field}'")]
    MissingField { key: String, field: &'static str },

    #[error("identity '{key}' has an unusable public key: {reason}")]
    InvalidKey { key: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("system clock is before the Unix epoch")]
    Clock,
}
