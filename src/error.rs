use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(Uuid),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Job run not found: {0}")]
    JobRunNotFound(Uuid),

    #[error("Step run not found: {0}")]
    StepRunNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(Uuid),

    /// The step run left `pending` before this transition could apply.
    #[error("Step run {0} is no longer pending")]
    StepRunNotPending(Uuid),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid payload for task {task}: {source}")]
    InvalidPayload {
        task: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Message {0} carries no tenant id")]
    MissingTenant(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{operation} exceeded its deadline of {after:?}")]
    DeadlineExceeded {
        operation: &'static str,
        after: Duration,
    },

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("Queue {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("Recovered panic in {context}: {message}")]
    Panic { context: String, message: String },

    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ControllerError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    /// Collapse a list of errors: none becomes `Ok`, one is returned as-is.
    pub fn from_many(mut errors: Vec<ControllerError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Multiple(errors)),
        }
    }

    pub fn is_not_pending(&self) -> bool {
        matches!(self, ControllerError::StepRunNotPending(_))
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Run `fut` under a deadline, mapping expiry to [`ControllerError::DeadlineExceeded`].
pub async fn with_deadline<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::DeadlineExceeded { operation, after }),
    }
}
