//! Message transport between job producers, queues and the job manager.
//!
//! Job messages travel on the topic named after their queue; updates travel on
//! [`JOB_UPDATE_TOPIC`](crate::update::JOB_UPDATE_TOPIC). A [`MessageHandler`] may ask for a
//! message to be delivered again, which is transport-level retry and has nothing to do
//! with job retries.

use crate::{error::JobMeshError, properties::Properties, update::JobUpdateCommand, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type SubscriptionId = u64;

/// A message as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub topic: String,
    pub command: JobUpdateCommand,
    pub body: Properties,
    /// 1 on first delivery, incremented for every requeue
    pub delivery_count: u32,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. Returning `true` asks the transport to deliver it again later.
    async fn on_message(&self, topic: &str, message: &TransportMessage) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, command: JobUpdateCommand, body: Properties)
    -> Result<()>;

    /// Starts delivering messages for `topic` to `handler`.
    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionId>;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Stops every delivery task. Undelivered messages are dropped.
    async fn close(&self);
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<TransportMessage>,
    token: CancellationToken,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<Subscriber>,
    /// Published while nobody listened; flushed to the first subscriber.
    retained: Vec<TransportMessage>,
}

/// In-process transport with one unbounded channel and delivery task per subscription.
pub struct InMemoryTransport {
    topics: DashMap<String, TopicState>,
    next_id: AtomicU64,
    redelivery_delay: Duration,
    max_redeliveries: Option<u32>,
    shutdown: CancellationToken,
}

impl InMemoryTransport {
    pub fn new(redelivery_delay: Duration, max_redeliveries: Option<u32>) -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            redelivery_delay,
            max_redeliveries,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &crate::config::TransportConfig) -> Self {
        Self::new(config.redelivery_delay, config.max_redeliveries)
    }

    /// Messages waiting for a first subscriber on `topic`.
    pub fn retained(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|state| state.retained.len())
            .unwrap_or(0)
    }

    fn spawn_delivery(
        &self,
        topic: String,
        handler: Arc<dyn MessageHandler>,
        sender: mpsc::UnboundedSender<TransportMessage>,
        mut receiver: mpsc::UnboundedReceiver<TransportMessage>,
        token: CancellationToken,
    ) {
        let redelivery_delay = self.redelivery_delay;
        let max_redeliveries = self.max_redeliveries;

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                if !handler.on_message(&topic, &message).await {
                    continue;
                }

                let redeliveries = message.delivery_count;
                if max_redeliveries.is_some_and(|max| redeliveries > max) {
                    warn!(
                        topic = %topic,
                        command = %message.command,
                        deliveries = message.delivery_count,
                        "Dropping message after exhausting redeliveries"
                    );
                    continue;
                }

                debug!(topic = %topic, deliveries = message.delivery_count, "Requeueing message");
                let sender = sender.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(redelivery_delay) => {
                            let _ = sender.send(TransportMessage {
                                delivery_count: message.delivery_count + 1,
                                ..message
                            });
                        }
                    }
                });
            }
            debug!(topic = %topic, "Delivery task stopped");
        });
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::from_config(&crate::config::TransportConfig::default())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        command: JobUpdateCommand,
        body: Properties,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(JobMeshError::Transport {
                message: "transport is closed".to_string(),
            });
        }

        let message = TransportMessage {
            topic: topic.to_string(),
            command,
            body,
            delivery_count: 1,
        };

        let mut state = self.topics.entry(topic.to_string()).or_default();
        state.subscribers.retain(|s| !s.sender.is_closed());
        if state.subscribers.is_empty() {
            state.retained.push(message);
            return Ok(());
        }
        for subscriber in &state.subscribers {
            // a closed receiver was cancelled concurrently; nothing left to deliver to
            let _ = subscriber.sender.send(message.clone());
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionId> {
        if self.shutdown.is_cancelled() {
            return Err(JobMeshError::Transport {
                message: "transport is closed".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = self.shutdown.child_token();

        {
            let mut state = self.topics.entry(topic.to_string()).or_default();
            for message in state.retained.drain(..) {
                let _ = sender.send(message);
            }
            state.subscribers.push(Subscriber {
                id,
                sender: sender.clone(),
                token: token.clone(),
            });
        }

        self.spawn_delivery(topic.to_string(), handler, sender, receiver, token);
        debug!(topic = %topic, subscription = id, "Subscribed");
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        for mut state in self.topics.iter_mut() {
            if let Some(index) = state.subscribers.iter().position(|s| s.id == id) {
                let subscriber = state.subscribers.remove(index);
                subscriber.token.cancel();
                return true;
            }
        }
        false
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.topics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, timeout};

    struct Recorder {
        seen: Mutex<Vec<(String, u32)>>,
        requeue_first: bool,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(requeue_first: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                requeue_first,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, _topic: &str, message: &TransportMessage) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = message.body["id"].as_str().unwrap_or_default().to_string();
            self.seen.lock().await.push((id, message.delivery_count));
            self.requeue_first && message.delivery_count == 1
        }
    }

    fn body(id: &str) -> Properties {
        let mut props = Properties::new();
        props.insert("id".to_string(), id.into());
        props
    }

    async fn wait_for_calls(recorder: &Recorder, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while recorder.calls.load(Ordering::SeqCst) < expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let transport = InMemoryTransport::new(Duration::from_millis(10), None);
        let recorder = Recorder::new(false);
        transport.subscribe("q", recorder.clone()).unwrap();

        for i in 0..5 {
            transport
                .publish("q", JobUpdateCommand::StartJob, body(&i.to_string()))
                .await
                .unwrap();
        }
        wait_for_calls(&recorder, 5).await;

        let seen: Vec<String> = recorder.seen.lock().await.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_retains_until_first_subscriber() {
        let transport = InMemoryTransport::new(Duration::from_millis(10), None);
        transport
            .publish("late", JobUpdateCommand::StartJob, body("a"))
            .await
            .unwrap();
        assert_eq!(transport.retained("late"), 1);

        let recorder = Recorder::new(false);
        transport.subscribe("late", recorder.clone()).unwrap();
        wait_for_calls(&recorder, 1).await;
        assert_eq!(transport.retained("late"), 0);
    }

    #[tokio::test]
    async fn test_requeue_redelivers() {
        let transport = InMemoryTransport::new(Duration::from_millis(10), Some(3));
        let recorder = Recorder::new(true);
        transport.subscribe("q", recorder.clone()).unwrap();
        transport
            .publish("q", JobUpdateCommand::StartJob, body("a"))
            .await
            .unwrap();

        wait_for_calls(&recorder, 2).await;
        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen, vec![("a".to_string(), 1), ("a".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_publish() {
        let transport = InMemoryTransport::default();
        transport.close().await;
        assert!(matches!(
            transport
                .publish("q", JobUpdateCommand::StartJob, body("a"))
                .await,
            Err(JobMeshError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let transport = InMemoryTransport::default();
        let id = transport.subscribe("q", Recorder::new(false)).unwrap();
        assert!(transport.unsubscribe(id));
        assert!(!transport.unsubscribe(id));
    }
}
