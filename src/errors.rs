use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Session already open for {0}")]
    AlreadyOpen(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Lock service error: {0}")]
    Lock(String),
    #[error("Lock {0} is not held by the caller")]
    LockNotHeld(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    /// Wraps an `anyhow` chain from a collaborator into a transport failure,
    /// keeping every context layer in the message.
    pub fn transport(err: anyhow::Error) -> Self {
        AppError::Transport(format!("{err:#}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Lock(err.to_string())
    }
}
