use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Expert table not found: {path}")]
    TableMissing { path: String },

    #[error("Expert table unreadable: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
