use crate::items::RepoError;
use crate::queue::QueueError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("repository: {0}")]
    Repo(#[from] RepoError),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// The backing store is unreachable; the whole cycle should back off.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AppError::Queue(QueueError::Unavailable(_)))
    }
}
