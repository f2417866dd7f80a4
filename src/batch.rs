use crate::config::BatchConfig;
use crate::metrics::CoreMetrics;
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Bound on a single durable-store write during a flush. A flush aggregates
/// many requests, so it never inherits any caller's deadline.
const FLUSH_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A single write destined for the durable store.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub name: String,
    pub delta: i64,
    pub ts: DateTime<Utc>,
}

/// Write-behind batch writer: absorbs per-operation write records on a
/// bounded channel and emits coalesced per-counter net deltas to the
/// durable store.
///
/// The pending map is owned exclusively by the flush loop; producers reach
/// it only through the intake channel.
pub struct BatchWriter {
    tx: mpsc::Sender<WriteRecord>,
    handle: JoinHandle<()>,
}

impl BatchWriter {
    /// Spawn the flush loop and return its handle.
    pub fn start(
        durable: Arc<dyn DurableStore>,
        config: BatchConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(flush_loop(durable, rx, config, metrics));
        Self { tx, handle }
    }

    /// Non-blocking enqueue. Returns false when the intake channel is full;
    /// the caller drops the record (the fast store remains the live truth,
    /// the durable side lags by the dropped deltas).
    pub fn enqueue(&self, name: &str, delta: i64) -> bool {
        let record = WriteRecord {
            name: name.to_string(),
            delta,
            ts: Utc::now(),
        };
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Write records currently buffered in the intake channel.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Close the intake, let the loop drain and flush pending once, and
    /// wait for it to exit.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            error!(error = %e, "batch writer task failed during shutdown");
        }
    }
}

async fn flush_loop(
    durable: Arc<dyn DurableStore>,
    mut rx: mpsc::Receiver<WriteRecord>,
    config: BatchConfig,
    metrics: Arc<CoreMetrics>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    let mut pending: HashMap<String, i64> = HashMap::new();

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(record) => {
                    *pending.entry(record.name).or_insert(0) += record.delta;
                    if pending.len() >= config.size {
                        flush(durable.as_ref(), &mut pending, &metrics).await;
                    }
                }
                None => {
                    // Intake closed: every buffered record has been drained
                    // into `pending` already, so one final flush suffices.
                    flush(durable.as_ref(), &mut pending, &metrics).await;
                    info!("batch writer shutting down");
                    break;
                }
            },
            _ = tick.tick() => {
                flush(durable.as_ref(), &mut pending, &metrics).await;
            }
        }
    }
}

/// Push every pending net delta to the durable store, best-effort per
/// entry. Failed entries are dropped, not retried; the next flush that
/// accumulates traffic for the same counter carries a fresh delta.
async fn flush(durable: &dyn DurableStore, pending: &mut HashMap<String, i64>, metrics: &CoreMetrics) {
    if pending.is_empty() {
        return;
    }

    let entries: Vec<(String, i64)> = pending.drain().collect();
    let total = entries.len();
    let mut flushed = 0usize;

    for (name, delta) in entries {
        match timeout(FLUSH_WRITE_TIMEOUT, durable.upsert_counter(&name, delta)).await {
            Ok(Ok(_)) => flushed += 1,
            Ok(Err(e)) => {
                error!(counter = %name, delta, error = %e, "flush write failed, delta dropped")
            }
            Err(_) => error!(counter = %name, delta, "flush write timed out, delta dropped"),
        }
    }

    if flushed > 0 {
        metrics.record_flush();
    }
    debug!(flushed, total, "flushed pending deltas");
}
