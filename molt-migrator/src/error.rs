use thiserror::Error;

pub type MigratorResult<T> = Result<T, MigratorError>;

/// Top-level service errors: everything that can go wrong before and around
/// the engine itself.
#[derive(Debug, Error)]
pub enum MigratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Migration(#[from] molt::error::MoltError),
}

impl MigratorError {
    pub fn config(err: impl std::fmt::Display) -> Self {
        MigratorError::Config(err.to_string())
    }
}
