use thiserror::Error;

#[derive(Debug, Error)]
pub enum PorterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signature verification failed: {0}")]
    AuthFailed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Version conflict on {entity} after {attempts} attempts")]
    Conflict { entity: String, attempts: u32 },

    #[error("Agent runtime error: {0}")]
    AgentRuntime(String),

    #[error("Channel error ({channel}): {reason}")]
    Channel { channel: String, reason: String },

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {ms}ms waiting for {what}")]
    Timeout { ms: u64, what: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PorterError {
    /// Short error code string used in structured logs and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PorterError::Config(_) => "CONFIG_ERROR",
            PorterError::AuthFailed(_) => "AUTH_FAILED",
            PorterError::Validation(_) => "VALIDATION_ERROR",
            PorterError::Storage(_) => "STORAGE_ERROR",
            PorterError::Conflict { .. } => "VERSION_CONFLICT",
            PorterError::AgentRuntime(_) => "AGENT_RUNTIME_ERROR",
            PorterError::Channel { .. } => "CHANNEL_ERROR",
            PorterError::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            PorterError::Serialization(_) => "SERIALIZATION_ERROR",
            PorterError::Io(_) => "IO_ERROR",
            PorterError::Timeout { .. } => "TIMEOUT",
            PorterError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, PorterError>;
