use spool_engine::JobState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] spool_engine::DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Download task panicked or was aborted: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Job {id} ended as {state:?}")]
    JobUnfinished { id: String, state: JobState },

    #[error("No job with id {0}")]
    UnknownJob(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
