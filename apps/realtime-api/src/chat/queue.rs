//! Bounded distribution queues and the per-kind distributor task.
//!
//! One pipeline instance exists per event kind (message, reaction), each with
//! its own small bounded queue. The queue is intentionally tiny: fan-out
//! should be near-instantaneous, so a full queue means the distributor is
//! stalled and the producer must be told rather than buffered behind.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::EnqueueError;
use crate::store::BatchWriter;

use super::events::{Envelope, EventPayload, OutboundEvent};
use super::registry::{drop_session_with_retry, SubscriptionRegistry};
use super::session::{DeliveryOutcome, SessionMap};
use super::writeback::{spawn_flush_task, WriteBack};

/// Producer-side handle for one event kind: distribution queue plus
/// write-back buffer. Cheap to clone; stored in `AppState`.
pub struct Pipeline<P: EventPayload> {
    distribution_tx: mpsc::Sender<Envelope<P>>,
    writeback: Arc<WriteBack<P>>,
}

impl<P: EventPayload> Clone for Pipeline<P> {
    fn clone(&self) -> Self {
        Self {
            distribution_tx: self.distribution_tx.clone(),
            writeback: self.writeback.clone(),
        }
    }
}

impl<P: EventPayload> Pipeline<P> {
    /// Accept an event for fan-out and persistence.
    ///
    /// The event enters the write-back buffer only once the distribution
    /// queue has accepted it; a rejected event is the producer's to retry or
    /// drop, so buffering it for persistence would duplicate it later.
    pub fn publish(&self, event: Envelope<P>) -> Result<(), EnqueueError> {
        self.distribution_tx
            .try_send(event.clone())
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
                // A closed queue means the distributor is gone; surface the
                // same backpressure signal rather than a distinct failure.
                mpsc::error::TrySendError::Closed(_) => EnqueueError::QueueFull,
            })?;
        self.writeback.enqueue(event);
        Ok(())
    }

    #[cfg(test)]
    pub fn writeback(&self) -> &WriteBack<P> {
        &self.writeback
    }
}

/// Sizing and timing for one pipeline instance.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub distribution_queue_size: usize,
    pub writeback_queue_size: usize,
    pub writeback_interval_ms: u64,
}

/// Background tasks owned by one pipeline. Held by `AppState` so the tasks
/// live as long as the process; aborted only in tests.
pub struct PipelineTasks {
    pub distributor: JoinHandle<()>,
    pub flusher: JoinHandle<()>,
}

/// Create the queue and buffer for one event kind and spawn its distributor
/// and flush tasks.
pub fn start<P: EventPayload>(
    config: PipelineConfig,
    registry: Arc<dyn SubscriptionRegistry>,
    sessions: Arc<SessionMap>,
    writer: Arc<dyn BatchWriter<P>>,
) -> (Pipeline<P>, PipelineTasks) {
    let (distribution_tx, distribution_rx) = mpsc::channel(config.distribution_queue_size);
    let writeback = Arc::new(WriteBack::new(config.writeback_queue_size, writer));

    let distributor = tokio::spawn(run_distributor::<P>(distribution_rx, registry, sessions));
    let flusher = spawn_flush_task(writeback.clone(), config.writeback_interval_ms);

    (
        Pipeline {
            distribution_tx,
            writeback,
        },
        PipelineTasks {
            distributor,
            flusher,
        },
    )
}

/// Distributor loop for one event kind.
///
/// Single consumer of the distribution queue, which is what preserves FIFO
/// delivery within a chat. Every per-session send is non-blocking: a slow or
/// vanished session never stalls delivery to the rest, it gets evicted and
/// asynchronously dropped from the registry instead.
async fn run_distributor<P: EventPayload>(
    mut rx: mpsc::Receiver<Envelope<P>>,
    registry: Arc<dyn SubscriptionRegistry>,
    sessions: Arc<SessionMap>,
) {
    while let Some(event) = rx.recv().await {
        let chat_id = event.chat_id.clone();
        let event_id = event.event_id;

        let subscriber_ids = match registry.sessions_for(&chat_id).await {
            Ok(ids) => ids,
            Err(err) => {
                // Degrade to "no deliverable subscribers" for this cycle
                // rather than stalling the queue behind a registry outage.
                tracing::warn!(
                    kind = P::KIND,
                    %chat_id,
                    event_id,
                    %err,
                    "registry lookup failed, skipping delivery this cycle"
                );
                continue;
            }
        };

        if subscriber_ids.is_empty() {
            continue;
        }

        let data = match serde_json::to_value(&event) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(kind = P::KIND, %chat_id, event_id, %err, "event serialization failed");
                continue;
            }
        };
        let outbound = Arc::new(OutboundEvent {
            event_name: P::DISPATCH,
            data,
        });

        for session_id in subscriber_ids {
            match sessions.try_deliver(&session_id, outbound.clone()) {
                DeliveryOutcome::Delivered => {}
                DeliveryOutcome::Backlogged => {
                    tracing::warn!(
                        kind = P::KIND,
                        %session_id,
                        %chat_id,
                        "session backlogged past its send buffer, evicting"
                    );
                    evict(&sessions, registry.clone(), session_id);
                }
                DeliveryOutcome::Gone => {
                    tracing::debug!(
                        kind = P::KIND,
                        %session_id,
                        %chat_id,
                        "session channel closed, evicting"
                    );
                    evict(&sessions, registry.clone(), session_id);
                }
            }
        }
    }
}

/// Remove a dead session's channel and asynchronously clear its
/// subscriptions. Runs off the distributor task so eviction never delays
/// fan-out to live sessions.
fn evict(sessions: &SessionMap, registry: Arc<dyn SubscriptionRegistry>, session_id: String) {
    sessions.remove(&session_id);
    tokio::spawn(async move {
        drop_session_with_retry(registry.as_ref(), &session_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::chat::events::MessagePayload;
    use crate::chat::registry::MemoryRegistry;
    use crate::chat::session::SESSION_SEND_BUFFER;
    use crate::store::MemoryStore;

    fn config(queue: usize) -> PipelineConfig {
        PipelineConfig {
            distribution_queue_size: queue,
            writeback_queue_size: 100,
            writeback_interval_ms: 5000,
        }
    }

    fn message(id: i64, chat_id: &str, text: &str) -> Envelope<MessagePayload> {
        Envelope {
            event_id: id,
            chat_id: chat_id.to_string(),
            sender_id: "prn_a".to_string(),
            sent_at: Utc::now(),
            payload: MessagePayload {
                text: text.to_string(),
            },
        }
    }

    async fn subscribe(
        registry: &MemoryRegistry,
        sessions: &SessionMap,
        session_id: &str,
        chat_id: &str,
    ) -> mpsc::Receiver<Arc<OutboundEvent>> {
        let (tx, rx) = mpsc::channel(SESSION_SEND_BUFFER);
        sessions.insert(session_id, tx);
        registry
            .subscribe(chat_id, session_id, "prn_x")
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn third_enqueue_into_capacity_two_queue_is_rejected() {
        // No distributor task: the queue stays stalled, as with one slow
        // consumer holding the loop.
        let (tx, _rx) = mpsc::channel(2);
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::<MessagePayload> {
            distribution_tx: tx,
            writeback: Arc::new(WriteBack::new(100, store)),
        };

        assert!(pipeline.publish(message(1, "chat_1", "a")).is_ok());
        assert!(pipeline.publish(message(2, "chat_1", "b")).is_ok());
        assert_eq!(
            pipeline.publish(message(3, "chat_1", "c")),
            Err(EnqueueError::QueueFull)
        );

        // Rejected events never reach the write-back buffer.
        assert_eq!(pipeline.writeback().len(), 2);
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers_in_order() {
        let registry = Arc::new(MemoryRegistry::new());
        let sessions = Arc::new(SessionMap::new());
        let store = Arc::new(MemoryStore::new());
        let (pipeline, tasks) = start::<MessagePayload>(
            config(5),
            registry.clone(),
            sessions.clone(),
            store.clone(),
        );

        let mut rx_a = subscribe(&registry, &sessions, "ses_a", "chat_1").await;
        let mut rx_b = subscribe(&registry, &sessions, "ses_b", "chat_1").await;

        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            pipeline
                .publish(message(i as i64 + 1, "chat_1", text))
                .unwrap();
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in ["one", "two", "three"] {
                let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .expect("delivery timed out")
                    .expect("channel closed");
                assert_eq!(event.event_name, "CHAT_MESSAGE");
                assert_eq!(event.data["text"], expected);
            }
        }

        tasks.distributor.abort();
        tasks.flusher.abort();
    }

    #[tokio::test]
    async fn unsubscribed_session_receives_nothing() {
        let registry = Arc::new(MemoryRegistry::new());
        let sessions = Arc::new(SessionMap::new());
        let store = Arc::new(MemoryStore::new());
        let (pipeline, tasks) = start::<MessagePayload>(
            config(5),
            registry.clone(),
            sessions.clone(),
            store.clone(),
        );

        let mut rx_a = subscribe(&registry, &sessions, "ses_a", "chat_1").await;

        // ses_b is connected but never subscribes.
        let (tx_b, mut rx_b) = mpsc::channel(SESSION_SEND_BUFFER);
        sessions.insert("ses_b", tx_b);

        pipeline.publish(message(1, "chat_1", "hello")).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed");
        assert_eq!(event.data["text"], "hello");

        assert!(rx_b.try_recv().is_err());

        tasks.distributor.abort();
        tasks.flusher.abort();
    }

    #[tokio::test]
    async fn closed_session_is_evicted_without_stalling_others() {
        let registry = Arc::new(MemoryRegistry::new());
        let sessions = Arc::new(SessionMap::new());
        let store = Arc::new(MemoryStore::new());
        let (pipeline, tasks) = start::<MessagePayload>(
            config(5),
            registry.clone(),
            sessions.clone(),
            store.clone(),
        );

        let rx_dead = subscribe(&registry, &sessions, "ses_dead", "chat_1").await;
        let mut rx_live = subscribe(&registry, &sessions, "ses_live", "chat_1").await;
        drop(rx_dead);

        pipeline.publish(message(1, "chat_1", "hello")).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx_live.recv())
            .await
            .expect("live session delivery timed out")
            .expect("channel closed");
        assert_eq!(event.data["text"], "hello");

        // Dead session disappears from the registry within one cleanup cycle.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let ids = registry.sessions_for("chat_1").await.unwrap();
                if ids == vec!["ses_live".to_string()] {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("dead session never evicted");

        tasks.distributor.abort();
        tasks.flusher.abort();
    }

    #[tokio::test]
    async fn accepted_events_reach_the_writeback_buffer() {
        let registry = Arc::new(MemoryRegistry::new());
        let sessions = Arc::new(SessionMap::new());
        let store = Arc::new(MemoryStore::new());
        let (pipeline, tasks) = start::<MessagePayload>(
            config(5),
            registry.clone(),
            sessions.clone(),
            store.clone(),
        );

        pipeline.publish(message(1, "chat_1", "a")).unwrap();
        pipeline.publish(message(2, "chat_1", "b")).unwrap();
        assert_eq!(pipeline.writeback().len(), 2);

        pipeline.writeback().flush().await;
        let ids: Vec<i64> = store.messages().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2]);

        tasks.distributor.abort();
        tasks.flusher.abort();
    }
}
