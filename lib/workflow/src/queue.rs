//! Queue transport contract and an in-memory implementation.
//!
//! Delivery is at-least-once: a handler that returns an error has its
//! message redelivered, and a handler may see the same message twice even
//! after succeeding. Handlers must be idempotent.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to connect to the transport.
    ConnectionFailed { message: String },
    /// Failed to publish a message.
    PublishFailed { queue: String, message: String },
    /// Failed to subscribe a worker.
    SubscribeFailed { queue: String, message: String },
    /// A worker is already registered for the queue.
    DuplicateWorker { queue: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "queue connection failed: {message}")
            }
            Self::PublishFailed { queue, message } => {
                write!(f, "publish to '{queue}' failed: {message}")
            }
            Self::SubscribeFailed { queue, message } => {
                write!(f, "subscribe to '{queue}' failed: {message}")
            }
            Self::DuplicateWorker { queue } => {
                write!(f, "worker already registered for '{queue}'")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// A handler failure. The message is redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    /// Requested delay before redelivery.
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Processes messages from one queue.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    /// Handles one delivery. Returning `Ok` acknowledges the message.
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

/// A named-queue transport.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    async fn register_worker(
        &self,
        queue: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), QueueError>;
}

/// A message that could not be delivered within the delivery limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: Vec<u8>,
    pub last_error: String,
}

struct Delivery {
    queue: String,
    payload: Vec<u8>,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    workers: HashMap<String, Arc<dyn QueueHandler>>,
    dead_letters: Vec<DeadLetter>,
}

/// In-process queue driven explicitly with [`InMemoryQueue::run_until_idle`].
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    max_deliveries: u32,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Safety valve for `run_until_idle` against handlers that never settle.
    const MAX_DELIVERIES_PER_DRAIN: usize = 100_000;

    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_deliveries: 10,
        }
    }

    /// Sets how many times a message is delivered before it is dead-lettered.
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Payloads waiting on the named queue.
    #[must_use]
    pub fn pending_on(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .pending
            .iter()
            .filter(|d| d.queue == queue)
            .map(|d| d.payload.clone())
            .collect()
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Delivers the oldest deliverable message. Returns false if none was delivered.
    ///
    /// Messages for queues without a worker stay queued.
    pub async fn deliver_one(&self) -> bool {
        let (delivery, handler) = {
            let mut state = self.lock();
            let Some(position) = state
                .pending
                .iter()
                .position(|d| state.workers.contains_key(&d.queue))
            else {
                return false;
            };
            let Some(delivery) = state.pending.remove(position) else {
                return false;
            };
            let Some(handler) = state.workers.get(&delivery.queue).cloned() else {
                return false;
            };
            (delivery, handler)
        };

        match handler.handle(&delivery.payload).await {
            Ok(()) => {
                debug!(queue = %delivery.queue, "message acknowledged");
            }
            Err(e) => {
                let attempts = delivery.attempts + 1;
                let mut state = self.lock();
                if attempts >= self.max_deliveries {
                    warn!(queue = %delivery.queue, attempts, error = %e, "message dead-lettered");
                    state.dead_letters.push(DeadLetter {
                        queue: delivery.queue,
                        payload: delivery.payload,
                        last_error: e.message,
                    });
                } else {
                    debug!(queue = %delivery.queue, attempts, error = %e, "message will be redelivered");
                    state.pending.push_back(Delivery {
                        attempts,
                        ..delivery
                    });
                }
            }
        }
        true
    }

    /// Delivers messages until no deliverable message remains.
    ///
    /// Redelivery delays are not simulated. Returns the number of deliveries.
    pub async fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while delivered < Self::MAX_DELIVERIES_PER_DRAIN && self.deliver_one().await {
            delivered += 1;
        }
        delivered
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        self.lock().pending.push_back(Delivery {
            queue: queue.to_string(),
            payload,
            attempts: 0,
        });
        Ok(())
    }

    async fn register_worker(
        &self,
        queue: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.workers.contains_key(queue) {
            return Err(QueueError::DuplicateWorker {
                queue: queue.to_string(),
            });
        }
        state.workers.insert(queue.to_string(), handler);
        Ok(())
    }
}
