use thiserror::Error;

#[derive(Debug, Error)]
pub enum LazyqError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("nothing to work: no handlers registered")]
    NothingToWork,

    #[error("cannot find job")]
    JobMissing,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // Displays as the bare message: it becomes the dead-letter reason.
    #[error("{0}")]
    Handler(String),

    #[error("job execution timed out")]
    HandlerTimeout,
}

pub type Result<T> = std::result::Result<T, LazyqError>;
