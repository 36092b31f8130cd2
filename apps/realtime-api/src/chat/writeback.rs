//! Write-back buffer and flush scheduler.
//!
//! Events that were accepted for distribution accumulate here and reach the
//! durable store in batches: a periodic timer bounds persistence latency, and
//! a full buffer forces an early flush. The buffer never drops an accepted
//! event without a log trace — a failed batch is re-queued at the head in
//! order and retried on later ticks until the retry budget runs out, at which
//! point the events are logged as lost writes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::StoreError;
use crate::store::BatchWriter;

use super::events::{Envelope, EventPayload};

/// Total write attempts per batch before its events are declared lost.
pub const MAX_FLUSH_ATTEMPTS: u32 = 3;

/// Result of one flush cycle.
///
/// The buffer's lifecycle is `Accumulating → Flushing → (Accumulating on
/// success | Retrying on failure)`, returning to `Accumulating` with the
/// batch reported lost once the retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered.
    Empty,
    /// Batch persisted; buffer back to accumulating.
    Flushed(usize),
    /// Write failed; batch re-queued at the head for the next tick.
    Retrying(u32),
    /// Retry budget exhausted; batch dropped and logged as lost writes.
    Lost(usize),
}

struct Inner<P> {
    buf: VecDeque<Envelope<P>>,
    attempts: u32,
}

/// Bounded write-back buffer for one event kind.
pub struct WriteBack<P: EventPayload> {
    inner: Mutex<Inner<P>>,
    flush_now: Notify,
    capacity: usize,
    writer: Arc<dyn BatchWriter<P>>,
}

impl<P: EventPayload> WriteBack<P> {
    pub fn new(capacity: usize, writer: Arc<dyn BatchWriter<P>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                attempts: 0,
            }),
            flush_now: Notify::new(),
            capacity,
            writer,
        }
    }

    /// Buffer an event for persistence. Never rejects: when the buffer is at
    /// capacity the flush task is woken to force an early flush instead.
    pub fn enqueue(&self, event: Envelope<P>) {
        let full = {
            let mut inner = self.inner.lock();
            inner.buf.push_back(event);
            inner.buf.len() >= self.capacity
        };
        if full {
            tracing::debug!(kind = P::KIND, "write-back buffer full, forcing early flush");
            self.flush_now.notify_one();
        }
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    /// Drain the buffer and write the batch. Called by the flush task on
    /// every timer tick and on forced early flushes.
    pub async fn flush(&self) -> FlushOutcome {
        let batch: Vec<Envelope<P>> = {
            let mut inner = self.inner.lock();
            if inner.buf.is_empty() {
                return FlushOutcome::Empty;
            }
            inner.buf.drain(..).collect()
        };

        match self.writer.write_batch(&batch).await {
            Ok(()) => {
                let count = batch.len();
                self.inner.lock().attempts = 0;
                tracing::debug!(kind = P::KIND, count, "write-back batch flushed");
                FlushOutcome::Flushed(count)
            }
            Err(err) => self.handle_failure(batch, err),
        }
    }

    fn handle_failure(&self, batch: Vec<Envelope<P>>, err: StoreError) -> FlushOutcome {
        let count = batch.len();
        let mut inner = self.inner.lock();
        inner.attempts += 1;

        if inner.attempts >= MAX_FLUSH_ATTEMPTS {
            let first = batch.first().map(|e| e.event_id).unwrap_or_default();
            let last = batch.last().map(|e| e.event_id).unwrap_or_default();
            inner.attempts = 0;
            tracing::error!(
                event = "lost_write",
                kind = P::KIND,
                count,
                first_event_id = first,
                last_event_id = last,
                %err,
                "write-back retries exhausted, events lost"
            );
            FlushOutcome::Lost(count)
        } else {
            let attempts = inner.attempts;
            // Re-queue at the head, preserving order ahead of newer events.
            for event in batch.into_iter().rev() {
                inner.buf.push_front(event);
            }
            tracing::warn!(
                kind = P::KIND,
                count,
                attempts,
                %err,
                "write-back batch failed, retrying on next tick"
            );
            FlushOutcome::Retrying(attempts)
        }
    }
}

/// Spawn the periodic flush task for one buffer. Fires on every interval tick
/// regardless of fill level, and immediately when the buffer reports full.
pub fn spawn_flush_task<P: EventPayload>(
    writeback: Arc<WriteBack<P>>,
    interval_ms: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick fires immediately; skip it.
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = writeback.flush_now.notified() => {}
            }
            writeback.flush().await;
        }
    })
}
