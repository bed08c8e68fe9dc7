use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Agent runtime exited with code {code}: {message}")]
    Runtime { code: i32, message: String },

    #[error("Malformed runtime output: {0}")]
    Parse(String),

    #[error("Timed out after {ms}ms waiting for a client slot")]
    PoolTimeout { ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
