//! Per-conversation message debouncing — merges bursts of rapidly arriving
//! messages for one owner key into a single ordered batch.
//!
//! Buffers live only in memory and do not survive a restart; durability is
//! the flush callback's responsibility. The buffer is removed from the map
//! *before* the callback runs, so delivery to the callback is at-most-once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use cadence_core::config::CoalescerConfig;

/// One coalesced unit of input. Immutable once created; owned by the buffer
/// until flush, then handed by value to the flush callback.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    pub id: i64,
    pub text: String,
    pub arrived_at: DateTime<Utc>,
    pub has_attachment: bool,
    pub attachment_kind: Option<String>,
}

impl BufferedMessage {
    pub fn text(id: i64, text: &str) -> Self {
        Self {
            id,
            text: text.to_string(),
            arrived_at: Utc::now(),
            has_attachment: false,
            attachment_kind: None,
        }
    }

    pub fn with_attachment(id: i64, text: &str, kind: &str) -> Self {
        Self {
            id,
            text: text.to_string(),
            arrived_at: Utc::now(),
            has_attachment: true,
            attachment_kind: Some(kind.to_string()),
        }
    }
}

/// Callback invoked with the owner key and the ordered batch, exactly once
/// per accumulation cycle. A failure is logged, not retried.
pub type FlushCallback =
    Arc<dyn Fn(String, Vec<BufferedMessage>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct OwnerBuffer {
    messages: Vec<BufferedMessage>,
    first_arrived: Instant,
    /// Stamp of the most recent arm, drawn from a process-wide monotonic
    /// counter. A fired timer whose captured stamp no longer matches knows
    /// the buffer was already flushed; stamps are never reused, so a timer
    /// from a flushed incarnation cannot match a recreated buffer either.
    generation: u64,
}

struct Inner {
    config: CoalescerConfig,
    buffers: Mutex<HashMap<String, OwnerBuffer>>,
    /// Source of arm stamps, shared across all owner keys and never reset.
    next_generation: AtomicU64,
    on_flush: FlushCallback,
}

/// Per-conversation debounce buffer. Owned instance — construct once and
/// inject it into whatever handles inbound messages; no globals.
pub struct MessageCoalescer {
    inner: Arc<Inner>,
}

impl MessageCoalescer {
    /// Create a coalescer with an async flush callback.
    pub fn new<F, Fut>(config: CoalescerConfig, on_flush: F) -> Self
    where
        F: Fn(String, Vec<BufferedMessage>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: FlushCallback = Arc::new(move |key, batch| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(on_flush(key, batch))
        });
        Self::with_callback(config, callback)
    }

    /// Create a coalescer from an already-boxed callback.
    pub fn with_callback(config: CoalescerConfig, on_flush: FlushCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                buffers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                on_flush,
            }),
        }
    }

    /// Append a message to the owner's buffer and re-arm its flush timer.
    ///
    /// Two safety overrides bypass the timer and flush immediately: the
    /// buffer reaching `max_buffered_messages`, or
    /// `max_buffer_wait_seconds` elapsing since the first buffered message.
    pub async fn add(&self, owner_key: &str, message: BufferedMessage) {
        let (batch, timer) = {
            let mut buffers = self.inner.buffers.lock().await;
            let buffer = buffers.entry(owner_key.to_string()).or_insert_with(|| OwnerBuffer {
                messages: Vec::new(),
                first_arrived: Instant::now(),
                generation: 0,
            });
            buffer.messages.push(message);
            buffer.generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

            let elapsed = buffer.first_arrived.elapsed();
            let size_limit = buffer.messages.len() >= self.inner.config.max_buffered_messages;
            let wait_limit =
                elapsed >= Duration::from_secs_f64(self.inner.config.max_buffer_wait_seconds);

            if size_limit || wait_limit {
                let buffer = buffers.remove(owner_key);
                tracing::debug!(
                    owner = owner_key,
                    size_limit,
                    wait_limit,
                    "safety override, flushing immediately"
                );
                (buffer.map(|b| b.messages), None)
            } else {
                // Jittered quiet period, capped so continuous re-arming can
                // never push the flush past the max-wait deadline.
                let jitter = rand::thread_rng().gen_range(
                    self.inner.config.debounce_min_seconds..=self.inner.config.debounce_max_seconds,
                );
                let remaining =
                    Duration::from_secs_f64(self.inner.config.max_buffer_wait_seconds) - elapsed;
                let delay = Duration::from_secs_f64(jitter).min(remaining);
                (None, Some((buffer.generation, delay)))
            }
        };

        if let Some(batch) = batch {
            flush(&self.inner, owner_key.to_string(), batch).await;
        } else if let Some((generation, delay)) = timer {
            let inner = Arc::clone(&self.inner);
            let owner = owner_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let batch = {
                    let mut buffers = inner.buffers.lock().await;
                    match buffers.get(&owner) {
                        // Still the latest arm for this buffer — take it.
                        Some(buffer) if buffer.generation == generation => {
                            buffers.remove(&owner).map(|b| b.messages)
                        }
                        // Re-armed or already flushed; stale timer is a no-op.
                        _ => None,
                    }
                };
                if let Some(batch) = batch {
                    flush(&inner, owner, batch).await;
                }
            });
        }
    }

    /// Number of messages currently buffered for an owner.
    pub async fn pending_count(&self, owner_key: &str) -> usize {
        let buffers = self.inner.buffers.lock().await;
        buffers.get(owner_key).map(|b| b.messages.len()).unwrap_or(0)
    }

    /// Drain every buffer immediately, in no particular owner order.
    /// For graceful shutdown — buffered messages are not persisted.
    pub async fn flush_all(&self) {
        let drained: Vec<(String, Vec<BufferedMessage>)> = {
            let mut buffers = self.inner.buffers.lock().await;
            buffers.drain().map(|(owner, b)| (owner, b.messages)).collect()
        };
        for (owner, batch) in drained {
            flush(&self.inner, owner, batch).await;
        }
    }
}

async fn flush(inner: &Arc<Inner>, owner_key: String, batch: Vec<BufferedMessage>) {
    if batch.is_empty() {
        return;
    }
    tracing::debug!(owner = %owner_key, count = batch.len(), "flushing message batch");
    if let Err(e) = (inner.on_flush)(owner_key.clone(), batch).await {
        // At-most-once: the buffer is already gone, the callback owns
        // whatever durability it needs.
        tracing::warn!(owner = %owner_key, error = %e, "flush callback failed");
    }
}
