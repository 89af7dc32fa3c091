//! NATS JetStream queue transport.
//!
//! All engine queues share one work-queue stream. Each named queue maps to a
//! subject under `stepweave.queue.` and is consumed by one durable pull
//! consumer, so a message is removed from the stream once a worker acks it.
//! Failed deliveries are nak'd with the handler's requested delay and
//! redelivered by the server up to `max_deliver` times.

use crate::queue::{Queue, QueueError, QueueHandler};
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Subject prefix for engine queues.
const QUEUE_SUBJECT_PREFIX: &str = "stepweave.queue";

/// Default stream name for engine queues.
const QUEUE_STREAM_NAME: &str = "STEPWEAVE_QUEUES";

/// Default number of deliveries before the server gives up on a message.
const DEFAULT_MAX_DELIVER: i64 = 10;

/// Default time the server waits for an ack before redelivering.
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Configuration for the NATS queue transport.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name (defaults to STEPWEAVE_QUEUES).
    pub stream_name: Option<String>,
    /// Deliveries per message before it is dropped.
    pub max_deliver: Option<i64>,
    /// Time to wait for an ack before redelivery.
    pub ack_wait: Option<Duration>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_name: None,
            max_deliver: None,
            ack_wait: None,
        }
    }

    fn stream(&self) -> &str {
        self.stream_name.as_deref().unwrap_or(QUEUE_STREAM_NAME)
    }

    fn max_deliver(&self) -> i64 {
        self.max_deliver.unwrap_or(DEFAULT_MAX_DELIVER)
    }

    fn ack_wait(&self) -> Duration {
        self.ack_wait.unwrap_or(DEFAULT_ACK_WAIT)
    }
}

/// Queue transport backed by NATS JetStream.
pub struct NatsQueue {
    jetstream: Arc<jetstream::Context>,
    config: NatsConfig,
    registered: Mutex<HashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsQueue {
    /// Connects to NATS and ensures the queue stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        let client = async_nats::connect(&config.url).await.map_err(|e| {
            QueueError::ConnectionFailed {
                message: e.to_string(),
            }
        })?;

        let jetstream = async_nats::jetstream::new(client);
        Self::ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            jetstream: Arc::new(jetstream),
            config,
            registered: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    async fn ensure_stream(
        jetstream: &jetstream::Context,
        config: &NatsConfig,
    ) -> Result<(), QueueError> {
        let stream_config = jetstream::stream::Config {
            name: config.stream().to_string(),
            subjects: vec![format!("{QUEUE_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create queue stream: {e}"),
            })?;

        Ok(())
    }

    fn subject(queue: &str) -> String {
        let token: String = queue
            .chars()
            .map(|c| match c {
                ' ' | '*' | '>' => '_',
                other => other,
            })
            .collect();
        format!("{QUEUE_SUBJECT_PREFIX}.{token}")
    }

    /// Durable consumer names may not contain dots or wildcards.
    fn consumer_name(queue: &str) -> String {
        queue
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Stops all worker tasks.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
        info!("queue workers stopped");
    }
}

#[async_trait]
impl Queue for NatsQueue {
    async fn enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        self.jetstream
            .publish(Self::subject(queue), payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::PublishFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn register_worker(
        &self,
        queue: &str,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<(), QueueError> {
        if !self.registered.lock().await.insert(queue.to_string()) {
            return Err(QueueError::DuplicateWorker {
                queue: queue.to_string(),
            });
        }

        let subscribe_failed = |message: String| QueueError::SubscribeFailed {
            queue: queue.to_string(),
            message,
        };

        let stream = self
            .jetstream
            .get_stream(self.config.stream())
            .await
            .map_err(|e| subscribe_failed(format!("failed to get stream: {e}")))?;

        let name = Self::consumer_name(queue);
        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(name.clone()),
            filter_subject: Self::subject(queue),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: self.config.ack_wait(),
            max_deliver: self.config.max_deliver(),
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&name, consumer_config)
            .await
            .map_err(|e| subscribe_failed(format!("failed to create consumer: {e}")))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_failed(format!("failed to get messages: {e}")))?;

        let queue_name = queue.to_string();
        let worker = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "failed to receive message");
                        continue;
                    }
                };

                match handler.handle(&message.payload).await {
                    Ok(()) => {
                        if let Err(e) = message.ack().await {
                            error!(queue = %queue_name, error = %e, "failed to ack message");
                        }
                    }
                    Err(e) => {
                        debug!(queue = %queue_name, error = %e, "handler failed, requesting redelivery");
                        if let Err(e) = message.ack_with(AckKind::Nak(e.retry_after)).await {
                            error!(queue = %queue_name, error = %e, "failed to nak message");
                        }
                    }
                }
            }
            info!(queue = %queue_name, "queue worker stopped");
        });

        self.workers.lock().await.push(worker);
        info!(queue = %queue, consumer = %name, "registered queue worker");
        Ok(())
    }
}
