use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{ControllerError, Result};
use crate::mq::{AckMode, Message, MessageHandler, MessageQueue, QueueName, Subscription, TaskKind};
use crate::sync::lock;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_HISTORY_LIMIT: usize = 10_000;
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(10);

struct QueueSlot {
    tx: mpsc::UnboundedSender<Message>,
    /// Present while nobody is subscribed
    rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

type Slots = Arc<Mutex<HashMap<String, QueueSlot>>>;

/// In-process message queue.
///
/// Each named queue is an unbounded channel with at most one consumer.
/// Messages published before anyone subscribes are buffered. Every handled
/// message runs on its own tracked task; closing a subscription waits for
/// them. The most recent published messages are also kept in a bounded
/// history log for inspection.
#[derive(Clone)]
pub struct InMemoryQueue {
    slots: Slots,
    history: Arc<Mutex<VecDeque<(String, Message)>>>,
    history_limit: usize,
    max_retries: u32,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_retries,
        }
    }

    /// Keep at most `limit` messages in the history; zero disables it.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Messages published to `queue` that are still in the history, oldest
    /// first. Redeliveries are not included.
    pub fn messages(&self, queue: &QueueName) -> Vec<Message> {
        let name = queue.to_string();
        lock(&self.history)
            .iter()
            .filter(|(q, _)| *q == name)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn messages_for_task(&self, queue: &QueueName, task: TaskKind) -> Vec<Message> {
        self.messages(queue)
            .into_iter()
            .filter(|m| m.id == task.as_str())
            .collect()
    }

    fn sender(&self, name: &str) -> mpsc::UnboundedSender<Message> {
        lock(&self.slots)
            .entry(name.to_string())
            .or_insert_with(QueueSlot::new)
            .tx
            .clone()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn subscribe(
        &self,
        queue: &QueueName,
        handler: MessageHandler,
        mode: AckMode,
    ) -> Result<Box<dyn Subscription>> {
        let name = queue.to_string();
        let (tx, mut rx) = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(name.clone()).or_insert_with(QueueSlot::new);
            let rx = slot
                .rx
                .take()
                .ok_or_else(|| ControllerError::AlreadySubscribed(name.clone()))?;
            (slot.tx.clone(), rx)
        };

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let max_retries = self.max_retries;
        let slots = self.slots.clone();

        let consumer = {
            let token = token.clone();
            let tracker = tracker.clone();
            let name = name.clone();
            tokio::spawn(async move {
                tracing::debug!(queue = %name, "Consumer started");
                loop {
                    let message = tokio::select! {
                        _ = token.cancelled() => break,
                        message = rx.recv() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };

                    let handler = handler.clone();
                    let tx = tx.clone();
                    let queue = name.clone();
                    tracker.spawn(deliver(queue, handler, message, mode, tx, max_retries));
                }

                // Hand the receiver back so the queue can be subscribed again
                if let Some(slot) = lock(&slots).get_mut(&name) {
                    slot.rx = Some(rx);
                }
                tracing::debug!(queue = %name, "Consumer stopped");
            })
        };

        Ok(Box::new(MemorySubscription {
            token,
            tracker,
            consumer,
        }))
    }

    async fn add_message(&self, queue: &QueueName, message: Message) -> Result<()> {
        let name = queue.to_string();
        if self.history_limit > 0 {
            let mut history = lock(&self.history);
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back((name.clone(), message.clone()));
        }
        self.sender(&name)
            .send(message)
            .map_err(|_| ControllerError::QueueClosed(name))
    }
}

async fn deliver(
    queue: String,
    handler: MessageHandler,
    message: Message,
    mode: AckMode,
    tx: mpsc::UnboundedSender<Message>,
    max_retries: u32,
) {
    let redelivery = match mode {
        AckMode::PreAck => None,
        AckMode::PostAck => Some(message.clone()),
    };
    let task = message.id.clone();

    let Err(e) = handler(message).await else {
        return;
    };

    match redelivery {
        None => {
            tracing::warn!(queue = %queue, task = %task, error = %e, "Handler failed, message already acknowledged");
        }
        Some(mut message) if message.retries < max_retries => {
            message.retries += 1;
            tracing::warn!(
                queue = %queue,
                task = %task,
                retries = message.retries,
                error = %e,
                "Handler failed, redelivering"
            );
            tokio::time::sleep(REDELIVERY_BACKOFF * message.retries).await;
            if tx.send(message).is_err() {
                tracing::warn!(queue = %queue, task = %task, "Queue gone, redelivery dropped");
            }
        }
        Some(message) => {
            tracing::error!(
                queue = %queue,
                task = %task,
                retries = message.retries,
                error = %e,
                "Handler failed, retries exhausted; dropping message"
            );
        }
    }
}

struct MemorySubscription {
    token: CancellationToken,
    tracker: TaskTracker,
    consumer: JoinHandle<()>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn close(self: Box<Self>) {
        self.token.cancel();
        let _ = self.consumer.await;
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;
    use uuid::Uuid;

    use super::*;

    fn check_message() -> Message {
        Message::new(TaskKind::CheckTenantQueue, Uuid::new_v4(), &()).unwrap()
    }

    fn counting_handler(count: Arc<AtomicU32>, fail_times: u32) -> MessageHandler {
        Arc::new(move |_msg: Message| {
            let count = count.clone();
            async move {
                let seen = count.fetch_add(1, Ordering::SeqCst);
                if seen < fail_times {
                    Err(ControllerError::Internal("flaky".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn buffered_messages_are_delivered_on_subscribe() {
        let mq = InMemoryQueue::new();
        let queue = QueueName::partition("p1");
        mq.add_message(&queue, check_message()).await.unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let sub = mq
            .subscribe(&queue, counting_handler(count.clone(), 0), AckMode::PreAck)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        sub.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(mq.messages(&queue).len(), 1);
    }

    #[tokio::test]
    async fn history_keeps_only_the_latest_messages() {
        let mq = InMemoryQueue::new().with_history_limit(2);
        let queue = QueueName::partition("p3");
        let sent: Vec<Message> = (0..3).map(|_| check_message()).collect();
        for message in &sent {
            mq.add_message(&queue, message.clone()).await.unwrap();
        }
        assert_eq!(mq.messages(&queue), sent[1..].to_vec());

        let silent = InMemoryQueue::new().with_history_limit(0);
        silent.add_message(&queue, check_message()).await.unwrap();
        assert!(silent.messages(&queue).is_empty());
    }

    #[tokio::test]
    async fn post_ack_failures_are_redelivered() {
        let mq = InMemoryQueue::with_max_retries(3);
        let queue = QueueName::JobProcessing;
        let count = Arc::new(AtomicU32::new(0));
        let sub = mq
            .subscribe(&queue, counting_handler(count.clone(), 2), AckMode::PostAck)
            .await
            .unwrap();

        mq.add_message(&queue, check_message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sub.close().await;

        // two failures, then success
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redelivery_stops_at_retry_limit() {
        let mq = InMemoryQueue::with_max_retries(2);
        let queue = QueueName::JobProcessing;
        let count = Arc::new(AtomicU32::new(0));
        let sub = mq
            .subscribe(&queue, counting_handler(count.clone(), u32::MAX), AckMode::PostAck)
            .await
            .unwrap();

        mq.add_message(&queue, check_message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sub.close().await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pre_ack_failures_are_not_redelivered() {
        let mq = InMemoryQueue::new();
        let queue = QueueName::partition("p2");
        let count = Arc::new(AtomicU32::new(0));
        let sub = mq
            .subscribe(&queue, counting_handler(count.clone(), u32::MAX), AckMode::PreAck)
            .await
            .unwrap();

        mq.add_message(&queue, check_message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sub.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected_until_close() {
        let mq = InMemoryQueue::new();
        let queue = QueueName::WorkflowProcessing;
        let count = Arc::new(AtomicU32::new(0));

        let first = mq
            .subscribe(&queue, counting_handler(count.clone(), 0), AckMode::PreAck)
            .await
            .unwrap();
        let second = mq
            .subscribe(&queue, counting_handler(count.clone(), 0), AckMode::PreAck)
            .await;
        assert!(matches!(second, Err(ControllerError::AlreadySubscribed(_))));

        first.close().await;
        let again = mq
            .subscribe(&queue, counting_handler(count, 0), AckMode::PreAck)
            .await
            .unwrap();
        again.close().await;
    }
}
