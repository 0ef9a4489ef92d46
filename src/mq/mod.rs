//! Message queue contract shared by the controller, the tenant queue
//! service and the dispatchers.
//!
//! Every message is a [`Message`] envelope: a task identifier from the
//! [`TaskKind`] catalog, a JSON payload, metadata that always names the
//! tenant, and a redelivery counter. Queues are addressed by [`QueueName`],
//! derived deterministically from partition or dispatcher ids so a message
//! lands on the process currently responsible for it.

pub mod memory;
pub mod tasks;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ControllerError, Result};

pub use memory::InMemoryQueue;
pub use tasks::TaskKind;

const TENANT_ID_KEY: &str = "tenant_id";

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Message {
    /// Task identifier, one of [`TaskKind`]
    pub id: String,
    pub payload: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub retries: u32,
}

impl Message {
    pub fn new<P: Serialize>(task: TaskKind, tenant_id: Uuid, payload: &P) -> Result<Self> {
        let payload = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                return Err(ControllerError::InvalidInput(format!(
                    "payload for {} must be an object, got {}",
                    task, other
                )))
            }
            Err(source) => {
                return Err(ControllerError::InvalidPayload {
                    task: task.to_string(),
                    source,
                })
            }
        };

        let mut metadata = Map::new();
        metadata.insert(TENANT_ID_KEY.to_string(), Value::String(tenant_id.to_string()));

        Ok(Self {
            id: task.to_string(),
            payload,
            metadata,
            retries: 0,
        })
    }

    pub fn task(&self) -> Result<TaskKind> {
        self.id.parse()
    }

    pub fn tenant_id(&self) -> Result<Uuid> {
        self.metadata
            .get(TENANT_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ControllerError::MissingTenant(self.id.clone()))
    }

    /// Decode the payload into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|source| {
            ControllerError::InvalidPayload {
                task: self.id.clone(),
                source,
            }
        })
    }
}

/// Well-known queue names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Lifecycle events for jobs and step runs
    JobProcessing,
    /// Workflow-level aggregation, consumed outside the controller
    WorkflowProcessing,
    /// Check-tenant-queue signals for one controller partition
    Partition(String),
    /// Assignment and cancellation messages for one dispatcher
    Dispatcher(Uuid),
}

impl QueueName {
    pub fn partition(partition_id: impl Into<String>) -> Self {
        QueueName::Partition(partition_id.into())
    }

    pub fn dispatcher(dispatcher_id: Uuid) -> Self {
        QueueName::Dispatcher(dispatcher_id)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::JobProcessing => write!(f, "job_processing_queue"),
            QueueName::WorkflowProcessing => write!(f, "workflow_processing_queue"),
            QueueName::Partition(id) => write!(f, "{}_controller", id),
            QueueName::Dispatcher(id) => write!(f, "{}_dispatcher", id),
        }
    }
}

/// When a delivered message counts as consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledged on receipt; a failing handler does not cause redelivery.
    PreAck,
    /// Acknowledged after the handler succeeds; failures are redelivered
    /// until the message's `retries` reaches the queue's limit.
    PostAck,
}

pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Handle returned by [`MessageQueue::subscribe`]; closing it stops delivery
/// and waits for in-flight handlers.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn subscribe(
        &self,
        queue: &QueueName,
        handler: MessageHandler,
        mode: AckMode,
    ) -> Result<Box<dyn Subscription>>;

    async fn add_message(&self, queue: &QueueName, message: Message) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::tasks::StepRunTaskPayload;

    #[test]
    fn queue_names_are_deterministic() {
        let id = Uuid::nil();
        assert_eq!(QueueName::JobProcessing.to_string(), "job_processing_queue");
        assert_eq!(
            QueueName::WorkflowProcessing.to_string(),
            "workflow_processing_queue"
        );
        assert_eq!(QueueName::partition("p-1").to_string(), "p-1_controller");
        assert_eq!(
            QueueName::dispatcher(id).to_string(),
            format!("{}_dispatcher", id)
        );
    }

    #[test]
    fn message_carries_tenant_and_payload() {
        let tenant = Uuid::new_v4();
        let step_run_id = Uuid::new_v4();
        let msg = Message::new(
            TaskKind::StepRunQueued,
            tenant,
            &StepRunTaskPayload { step_run_id },
        )
        .unwrap();

        assert_eq!(msg.id, "step-run-queued");
        assert_eq!(msg.task().unwrap(), TaskKind::StepRunQueued);
        assert_eq!(msg.tenant_id().unwrap(), tenant);
        assert_eq!(msg.retries, 0);

        let payload: StepRunTaskPayload = msg.decode().unwrap();
        assert_eq!(payload.step_run_id, step_run_id);
    }

    #[test]
    fn missing_tenant_is_an_error() {
        let mut msg =
            Message::new(TaskKind::CheckTenantQueue, Uuid::new_v4(), &()).unwrap();
        msg.metadata.clear();
        assert!(matches!(
            msg.tenant_id(),
            Err(ControllerError::MissingTenant(_))
        ));
    }

    #[test]
    fn malformed_payload_is_reported() {
        let msg = Message::new(TaskKind::StepRunQueued, Uuid::new_v4(), &()).unwrap();
        let err = msg.decode::<StepRunTaskPayload>().unwrap_err();
        assert!(matches!(err, ControllerError::InvalidPayload { .. }));
    }
}
