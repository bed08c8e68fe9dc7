use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Version conflict on session {id} after {attempts} attempts")]
    ConflictExhausted { id: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] porter_storage::StorageError),

    #[error("Corrupt session record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
