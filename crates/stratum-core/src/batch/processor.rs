//! Batch processor: aggregates single items into grouped remote calls.
//!
//! Callers submit items with [`BatchProcessor::add_item`] and await the
//! returned [`BatchTicket`]. A background worker wakes on a flush signal, on
//! the flush interval, or when the queue reaches `max_batch_size`, and drains
//! batches of at most `max_batch_size` items while the queue holds at least
//! `min_batch_size` items or the oldest item has waited `max_wait_time`.
//!
//! Every ticket resolves exactly once: with the item's output, with
//! `ItemFailed` after `max_retry_count` retries, or with `Cancelled` when the
//! processor stops.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use stratum_types::config::BatchConfig;
use stratum_types::error::{AdapterError, ConfigError, ErrorDetail, ErrorKind, HasErrorKind};
use stratum_types::event::RuntimeEvent;
use stratum_types::status::BatchMetrics;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handler::{BatchHandler, BatchResults};
use crate::event::EventBus;
use crate::resilience::CircuitBreaker;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch processor '{0}' is stopped")]
    Stopped(String),

    #[error("item cancelled before it was processed")]
    Cancelled,

    #[error("item failed after {attempts} attempts: {error}")]
    ItemFailed { attempts: u32, error: ErrorDetail },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HasErrorKind for BatchError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Stopped(_) | Self::Cancelled => ErrorKind::Cancelled,
            Self::ItemFailed { .. } => ErrorKind::BatchProcessing,
            Self::Config(_) => ErrorKind::Validation,
        }
    }
}

type ItemResult<O> = Result<O, BatchError>;

/// Completion handle for one submitted item.
///
/// Resolves to `Cancelled` if the processor is dropped without `stop`.
#[derive(Debug)]
pub struct BatchTicket<O> {
    rx: oneshot::Receiver<ItemResult<O>>,
}

impl<O> Future for BatchTicket<O> {
    type Output = ItemResult<O>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BatchError::Cancelled)))
    }
}

/// Optional collaborators for a processor.
#[derive(Default)]
pub struct BatchOptions {
    /// Wraps every batch call; an open circuit fails the whole batch.
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub event_bus: Option<EventBus>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Queued<I, O> {
    item: I,
    tx: oneshot::Sender<ItemResult<O>>,
    enqueued_at: Instant,
    retries: u32,
}

struct QueueState<I, O> {
    items: VecDeque<Queued<I, O>>,
    stopped: bool,
    flush_requested: bool,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    cancelled: u64,
    batches_processed: u64,
    batches_failed: u64,
    batched_items: u64,
    processing_time: Duration,
}

struct Shared<H: BatchHandler> {
    name: String,
    config: BatchConfig,
    handler: H,
    breaker: Option<Arc<CircuitBreaker>>,
    event_bus: Option<EventBus>,
    queue: Mutex<QueueState<H::Item, H::Output>>,
    counters: Mutex<Counters>,
    wake: Notify,
    shutdown: CancellationToken,
}

struct Meta<O> {
    tx: oneshot::Sender<ItemResult<O>>,
    retries: u32,
}

impl<H: BatchHandler> Shared<H> {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState<H::Item, H::Output>> {
        self.queue.lock().expect("batch queue lock poisoned")
    }

    fn lock_counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().expect("batch counters lock poisoned")
    }

    async fn run(self: Arc<Self>) {
        let interval = self.config.flush_interval();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            self.drain_ready().await;
        }
        tracing::debug!(processor = self.name.as_str(), "batch worker stopped");
    }

    /// Process batches until nothing is due.
    async fn drain_ready(&self) {
        // A flush forces out what was queued when it was requested, not
        // items requeued while draining.
        let mut forced = {
            let mut q = self.lock_queue();
            if std::mem::take(&mut q.flush_requested) {
                q.items.len()
            } else {
                0
            }
        };

        loop {
            let batch = {
                let mut q = self.lock_queue();
                // Whatever is still queued belongs to `stop`.
                if q.stopped || self.shutdown.is_cancelled() {
                    break;
                }
                let Some(oldest) = q.items.front().map(|i| i.enqueued_at) else {
                    break;
                };
                let due = forced > 0
                    || q.items.len() >= self.config.min_batch_size
                    || oldest.elapsed() >= self.config.max_wait_time();
                if !due {
                    break;
                }
                let n = q.items.len().min(self.config.max_batch_size);
                forced = forced.saturating_sub(n);
                q.items.drain(..n).collect::<Vec<_>>()
            };
            self.process_batch(batch).await;
        }
    }

    async fn process_batch(&self, batch: Vec<Queued<H::Item, H::Output>>) {
        let size = batch.len();
        let (items, metas): (Vec<H::Item>, Vec<Meta<H::Output>>) = batch
            .into_iter()
            .map(|q| {
                (
                    q.item,
                    Meta {
                        tx: q.tx,
                        retries: q.retries,
                    },
                )
            })
            .unzip();

        let started = Instant::now();
        let outcome = self.call_handler(&items).await;
        let elapsed = started.elapsed();

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut requeue = Vec::new();

        let batch_failed = outcome.is_err();
        match outcome {
            Ok(mut results) => {
                for (idx, (item, meta)) in items.into_iter().zip(metas).enumerate() {
                    match results.remove(&idx) {
                        Some(Ok(output)) => {
                            succeeded += 1;
                            let _ = meta.tx.send(Ok(output));
                        }
                        Some(Err(e)) => {
                            let detail = ErrorDetail::from_error(&e);
                            if !self.retry_or_fail(item, meta, detail, &mut requeue) {
                                failed += 1;
                            }
                        }
                        None => {
                            let detail = ErrorDetail::new(
                                ErrorKind::BatchProcessing,
                                format!("batch handler returned no result for item {idx}"),
                            );
                            if !self.retry_or_fail(item, meta, detail, &mut requeue) {
                                failed += 1;
                            }
                        }
                    }
                }
            }
            Err(detail) => {
                tracing::warn!(
                    processor = self.name.as_str(),
                    size,
                    error = %detail,
                    "batch call failed"
                );
                for (item, meta) in items.into_iter().zip(metas) {
                    if !self.retry_or_fail(item, meta, detail.clone(), &mut requeue) {
                        failed += 1;
                    }
                }
            }
        }

        let requeued = requeue.len();
        if !requeue.is_empty() {
            let mut q = self.lock_queue();
            if q.stopped {
                drop(q);
                for queued in requeue {
                    let _ = queued.tx.send(Err(BatchError::Cancelled));
                }
                self.lock_counters().cancelled += requeued as u64;
            } else {
                q.items.extend(requeue);
            }
        }

        {
            let mut c = self.lock_counters();
            c.batches_processed += 1;
            if batch_failed {
                c.batches_failed += 1;
            }
            c.batched_items += size as u64;
            c.processing_time += elapsed;
            c.succeeded += succeeded as u64;
            c.failed += failed as u64;
            c.retried += requeued as u64;
        }

        tracing::debug!(
            processor = self.name.as_str(),
            size,
            succeeded,
            requeued,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch processed"
        );
        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::BatchFlushed {
                processor: self.name.clone(),
                size,
                succeeded,
                requeued,
                failed,
            });
        }
    }

    /// Requeue the item if it has retries left, otherwise fail its ticket.
    /// Returns `true` when requeued.
    fn retry_or_fail(
        &self,
        item: H::Item,
        meta: Meta<H::Output>,
        error: ErrorDetail,
        requeue: &mut Vec<Queued<H::Item, H::Output>>,
    ) -> bool {
        if meta.retries < self.config.max_retry_count {
            requeue.push(Queued {
                item,
                tx: meta.tx,
                enqueued_at: Instant::now(),
                retries: meta.retries + 1,
            });
            true
        } else {
            let _ = meta.tx.send(Err(BatchError::ItemFailed {
                attempts: meta.retries + 1,
                error,
            }));
            false
        }
    }

    async fn call_handler(&self, items: &[H::Item]) -> Result<BatchResults<H::Output>, ErrorDetail> {
        let call = async {
            match self.config.batch_timeout() {
                Some(limit) => tokio::time::timeout(limit, self.handler.process(items))
                    .await
                    .unwrap_or_else(|_| {
                        Err(AdapterError::Timeout(format!(
                            "batch of {} items exceeded {limit:?}",
                            items.len()
                        )))
                    }),
                None => self.handler.process(items).await,
            }
        };

        match &self.breaker {
            Some(breaker) => breaker
                .execute(|| call)
                .await
                .map_err(|e| ErrorDetail::from_error(&e)),
            None => call.await.map_err(|e| ErrorDetail::from_error(&e)),
        }
    }
}

// ---------------------------------------------------------------------------
// BatchProcessor
// ---------------------------------------------------------------------------

/// Aggregates items into batch calls on a background worker.
pub struct BatchProcessor<H: BatchHandler> {
    shared: Arc<Shared<H>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: BatchHandler> BatchProcessor<H> {
    /// Validate `config` and spawn the worker.
    pub fn start(name: impl Into<String>, config: BatchConfig, handler: H) -> Result<Self, BatchError> {
        Self::start_with(name, config, handler, BatchOptions::default())
    }

    pub fn start_with(
        name: impl Into<String>,
        config: BatchConfig,
        handler: H,
        options: BatchOptions,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            name: name.into(),
            config,
            handler,
            breaker: options.breaker,
            event_bus: options.event_bus,
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
                flush_requested: false,
            }),
            counters: Mutex::new(Counters::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let worker = tokio::spawn(Arc::clone(&shared).run());
        tracing::info!(processor = shared.name.as_str(), "batch processor started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Queue one item. Reaching `max_batch_size` wakes the worker at once.
    pub fn add_item(&self, item: H::Item) -> Result<BatchTicket<H::Output>, BatchError> {
        let mut tickets = self.add_many(std::iter::once(item))?;
        tickets.pop().ok_or(BatchError::Cancelled)
    }

    /// Queue several items under one lock, tickets in input order.
    pub fn add_many<It>(&self, items: It) -> Result<Vec<BatchTicket<H::Output>>, BatchError>
    where
        It: IntoIterator<Item = H::Item>,
    {
        let now = Instant::now();
        let (tickets, len) = {
            let mut q = self.shared.lock_queue();
            if q.stopped {
                return Err(BatchError::Stopped(self.shared.name.clone()));
            }
            let mut tickets = Vec::new();
            for item in items {
                let (tx, rx) = oneshot::channel();
                q.items.push_back(Queued {
                    item,
                    tx,
                    enqueued_at: now,
                    retries: 0,
                });
                tickets.push(BatchTicket { rx });
            }
            (tickets, q.items.len())
        };

        self.shared.lock_counters().submitted += tickets.len() as u64;
        if len >= self.shared.config.max_batch_size {
            self.shared.wake.notify_one();
        }
        Ok(tickets)
    }

    /// Ask the worker to process everything queued right now, regardless of
    /// batch size or age.
    pub fn flush(&self) {
        self.shared.lock_queue().flush_requested = true;
        self.shared.wake.notify_one();
    }

    /// Stop the worker after its current batch and cancel every pending item.
    pub async fn stop(&self) {
        {
            let mut q = self.shared.lock_queue();
            if q.stopped {
                return;
            }
            q.stopped = true;
        }
        self.shared.shutdown.cancel();

        let worker = self
            .worker
            .lock()
            .expect("batch worker lock poisoned")
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(
                    processor = self.shared.name.as_str(),
                    error = %e,
                    "batch worker panicked"
                );
            }
        }

        let leftovers: Vec<_> = self.shared.lock_queue().items.drain(..).collect();
        let cancelled = leftovers.len();
        for queued in leftovers {
            let _ = queued.tx.send(Err(BatchError::Cancelled));
        }
        self.shared.lock_counters().cancelled += cancelled as u64;
        tracing::info!(
            processor = self.shared.name.as_str(),
            cancelled,
            "batch processor stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock_queue().stopped
    }

    pub fn pending(&self) -> usize {
        self.shared.lock_queue().items.len()
    }

    pub fn metrics(&self) -> BatchMetrics {
        let pending = self.pending();
        let c = self.shared.lock_counters();
        let resolved = c.succeeded + c.failed;
        let per_batch = |total: f64| {
            if c.batches_processed == 0 {
                0.0
            } else {
                total / c.batches_processed as f64
            }
        };
        BatchMetrics {
            name: self.shared.name.clone(),
            items_submitted: c.submitted,
            items_succeeded: c.succeeded,
            items_failed: c.failed,
            items_retried: c.retried,
            items_cancelled: c.cancelled,
            batches_processed: c.batches_processed,
            batches_failed: c.batches_failed,
            pending,
            average_batch_size: per_batch(c.batched_items as f64),
            average_processing_ms: per_batch(c.processing_time.as_secs_f64() * 1_000.0),
            success_rate: if resolved == 0 {
                1.0
            } else {
                c.succeeded as f64 / resolved as f64
            },
        }
    }
}

impl<H: BatchHandler> Drop for BatchProcessor<H> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<H: BatchHandler> std::fmt::Debug for BatchProcessor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}
