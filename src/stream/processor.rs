//! # Stream Processor
//!
//! Runs every item of a (possibly endless) source through a caller function
//! with bounded concurrency, optional per-item and stream-wide deadlines, and
//! memory-driven backpressure on admission.
//!
//! Each call to [`StreamProcessor::process`] starts an independent run driven
//! by a spawned task. Results are yielded in completion order, not submission
//! order. A run ends when the source is exhausted and every admitted item has
//! settled, or early on abort, stream timeout or an unhandled item error. In
//! the early cases the terminal error is the last element of the stream and
//! any in-flight items are dropped.

use super::config::StreamConfig;
use super::memory::{MemoryProbe, SystemMemoryProbe};
use super::signal::{CancellationSignal, CancellationSource};
use super::stats::{StreamCounters, StreamStats};
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{
    default_sink, panic_message, publish_isolated, run_callback_isolated, EventSink,
    ResilienceEvent,
};
use crate::timeout::{TimeoutContext, TimeoutManager, TimeoutOptions};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

type ErrorHook<T> = dyn Fn(&ResilienceError, &T, usize) -> bool + Send + Sync;

/// Caller hook deciding whether a failed item is skipped (`true`) or ends the run
struct ErrorHandler<T> {
    hook: Arc<ErrorHook<T>>,
    retain: fn(&T) -> T,
}

/// How a run ended
#[derive(Debug)]
enum RunEnd {
    Completed,
    Aborted(String),
    TimedOut(Duration),
    ItemFailed(usize),
    Abandoned,
}

type ItemOutcome<T, R> = (usize, Option<T>, ResilienceResult<R>);

pub struct StreamProcessor {
    config: StreamConfig,
    timeouts: TimeoutManager,
    probe: Arc<dyn MemoryProbe>,
    events: Arc<dyn EventSink>,
    counters: Arc<StreamCounters>,
    runs: Arc<DashMap<u64, CancellationSource>>,
    next_run: AtomicU64,
}

impl StreamProcessor {
    /// Create a processor with a private timeout manager and the system memory probe
    pub fn new(config: StreamConfig) -> ResilienceResult<Self> {
        Self::with_timeout_manager(config, TimeoutManager::default())
    }

    pub fn with_timeout_manager(
        config: StreamConfig,
        timeouts: TimeoutManager,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            timeouts,
            probe: Arc::new(SystemMemoryProbe::new()),
            events: default_sink(),
            counters: Arc::new(StreamCounters::default()),
            runs: Arc::new(DashMap::new()),
            next_run: AtomicU64::new(1),
        })
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Process `source`, ending the run on the first item error.
    ///
    /// Must be called from within a tokio runtime.
    pub fn process<S, F, Fut, R>(&self, source: S, item_fn: F) -> ResultStream<R>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        F: Fn(S::Item, usize, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.start(source, item_fn, None)
    }

    /// Process `source`, asking `on_error` what to do with each failed item.
    ///
    /// Returning `true` skips the item and keeps going; `false` ends the run
    /// with the item's error. A panicking hook counts as `false`.
    pub fn process_with_error_handler<S, F, Fut, R, H>(
        &self,
        source: S,
        item_fn: F,
        on_error: H,
    ) -> ResultStream<R>
    where
        S: Stream + Send + 'static,
        S::Item: Clone + Send + 'static,
        F: Fn(S::Item, usize, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + 'static,
        H: Fn(&ResilienceError, &S::Item, usize) -> bool + Send + Sync + 'static,
    {
        let handler = ErrorHandler {
            hook: Arc::new(on_error),
            retain: <S::Item as Clone>::clone,
        };
        self.start(source, item_fn, Some(handler))
    }

    /// Cancel every active run. Returns how many were cancelled.
    pub fn abort(&self, reason: &str) -> usize {
        let cancelled = self
            .runs
            .iter()
            .filter(|run| run.value().cancel(reason))
            .count();
        if cancelled > 0 {
            info!(runs = cancelled, reason = reason, "Stream processor aborted");
        }
        cancelled
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    fn start<S, T, F, Fut, R>(
        &self,
        source: S,
        item_fn: F,
        on_error: Option<ErrorHandler<T>>,
    ) -> ResultStream<R>
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
        F: Fn(T, usize, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationSource::new();
        self.runs.insert(id, cancel.clone());

        let (results, receiver) = mpsc::channel(self.config.concurrency);
        let run = Run {
            id,
            config: self.config.clone(),
            timeouts: self.timeouts.clone(),
            probe: Arc::clone(&self.probe),
            events: Arc::clone(&self.events),
            counters: Arc::clone(&self.counters),
            runs: Arc::clone(&self.runs),
            cancel: cancel.clone(),
            results,
        };
        debug!(run = id, concurrency = self.config.concurrency, "Stream run started");

        ResultStream {
            receiver,
            cancel,
            counters: Arc::clone(&self.counters),
            driver: tokio::spawn(run.drive(source, item_fn, on_error)),
        }
    }
}

impl fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("config", &self.config)
            .field("probe", &self.probe)
            .field("active_runs", &self.runs.len())
            .finish()
    }
}

/// State owned by one run's driver task
struct Run<R> {
    id: u64,
    config: StreamConfig,
    timeouts: TimeoutManager,
    probe: Arc<dyn MemoryProbe>,
    events: Arc<dyn EventSink>,
    counters: Arc<StreamCounters>,
    runs: Arc<DashMap<u64, CancellationSource>>,
    cancel: CancellationSource,
    results: mpsc::Sender<ResilienceResult<R>>,
}

impl<R: Send + 'static> Run<R> {
    async fn drive<S, T, F, Fut>(self, source: S, item_fn: F, on_error: Option<ErrorHandler<T>>)
    where
        S: Stream<Item = T> + Send + 'static,
        T: Send + 'static,
        F: Fn(T, usize, CancellationSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let context = Arc::new(
            self.timeouts
                .create_context(format!("stream-run-{}", self.id)),
        );
        let item_fn = Arc::new(item_fn);
        let signal = self.cancel.signal();
        let stream_deadline = self.config.stream_timeout.map(|limit| Instant::now() + limit);

        let mut source = Box::pin(source.fuse());
        let mut in_flight = FuturesUnordered::new();
        let mut source_done = false;
        let mut admitted = 0usize;
        let mut admit_after: Option<Instant> = None;

        let end = loop {
            if source_done && in_flight.is_empty() {
                break RunEnd::Completed;
            }
            let can_admit =
                !source_done && admit_after.is_none() && in_flight.len() < self.config.concurrency;

            tokio::select! {
                biased;
                reason = signal.cancelled() => break RunEnd::Aborted(reason),
                _ = wait_until(stream_deadline) => {
                    break RunEnd::TimedOut(self.config.stream_timeout.unwrap_or_default());
                }
                _ = self.results.closed() => break RunEnd::Abandoned,
                Some((index, item, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    let end = self
                        .settle(index, item, outcome, on_error.as_ref(), &signal, stream_deadline)
                        .await;
                    if let Some(end) = end {
                        break end;
                    }
                }
                _ = wait_until(admit_after), if admit_after.is_some() => admit_after = None,
                next = source.next(), if can_admit => match next {
                    None => source_done = true,
                    Some(item) => {
                        let index = admitted;
                        admitted += 1;
                        let retained = on_error.as_ref().map(|handler| (handler.retain)(&item));
                        in_flight.push(run_item(
                            Arc::clone(&item_fn),
                            item,
                            index,
                            retained,
                            signal.clone(),
                            self.timeouts.clone(),
                            self.config.item_timeout,
                            Arc::clone(&context),
                        ));
                        if admitted % self.config.memory_check_interval == 0 {
                            admit_after = self.check_memory().map(|delay| Instant::now() + delay);
                        }
                    }
                },
            }
        };

        let dropped = in_flight.len();
        drop(in_flight);
        self.finish(end, admitted, dropped).await;

        match Arc::try_unwrap(context) {
            Ok(context) => {
                context.release();
            }
            Err(context) => {
                context.cleanup();
            }
        }
        self.runs.remove(&self.id);
    }

    /// Deliver one settled item. Returns how the run ends, if it does.
    async fn settle<T>(
        &self,
        index: usize,
        item: Option<T>,
        outcome: ResilienceResult<R>,
        on_error: Option<&ErrorHandler<T>>,
        signal: &CancellationSignal,
        stream_deadline: Option<Instant>,
    ) -> Option<RunEnd> {
        let error = match outcome {
            Ok(value) => {
                self.counters.record_processed();
                return self.deliver(Ok(value), signal, stream_deadline).await;
            }
            Err(error) => error,
        };

        if error.is_timeout() {
            self.counters.record_timeout();
        }

        let mut skip = false;
        if let (Some(handler), Some(item)) = (on_error, item.as_ref()) {
            run_callback_isolated(self.events.as_ref(), "stream", "on_error", || {
                skip = (handler.hook)(&error, item, index);
            });
        }
        self.counters.record_error(skip);

        if skip {
            debug!(run = self.id, index = index, error = %error, "Stream item skipped");
            return None;
        }

        warn!(run = self.id, index = index, error = %error, "Stream item failed; ending run");
        match self.deliver(Err(error), signal, stream_deadline).await {
            Some(RunEnd::Abandoned) | None => Some(RunEnd::ItemFailed(index)),
            Some(end) => Some(end),
        }
    }

    /// Wait for buffer space while still observing abort and the stream deadline,
    /// so a consumer that stops polling cannot delay either.
    async fn deliver(
        &self,
        result: ResilienceResult<R>,
        signal: &CancellationSignal,
        stream_deadline: Option<Instant>,
    ) -> Option<RunEnd> {
        tokio::select! {
            biased;
            reason = signal.cancelled() => Some(RunEnd::Aborted(reason)),
            _ = wait_until(stream_deadline) => {
                Some(RunEnd::TimedOut(self.config.stream_timeout.unwrap_or_default()))
            }
            permit = self.results.reserve() => match permit {
                Ok(permit) => {
                    permit.send(result);
                    None
                }
                Err(_) => Some(RunEnd::Abandoned),
            },
        }
    }

    /// Sample memory and update backpressure. Returns the admission delay while active.
    fn check_memory(&self) -> Option<Duration> {
        let used_mb = self.probe.used_memory_mb();
        let threshold_mb = self.config.memory_threshold_mb;
        self.counters.record_memory(used_mb);

        if used_mb > threshold_mb {
            if self.counters.set_backpressure(true) {
                debug!(run = self.id, memory_mb = used_mb, "Backpressure on");
                publish_isolated(
                    self.events.as_ref(),
                    ResilienceEvent::BackpressureActivated {
                        memory_mb: used_mb,
                        threshold_mb,
                    },
                );
            }
            self.probe.request_gc();
        } else if self.counters.backpressure_active()
            && (used_mb as f64) < self.config.release_threshold_mb()
            && self.counters.set_backpressure(false)
        {
            debug!(run = self.id, memory_mb = used_mb, "Backpressure off");
            publish_isolated(
                self.events.as_ref(),
                ResilienceEvent::BackpressureDeactivated { memory_mb: used_mb },
            );
        }

        self.counters
            .backpressure_active()
            .then(|| self.config.backpressure_delay_for(used_mb))
    }

    async fn finish(&self, end: RunEnd, admitted: usize, dropped: usize) {
        match end {
            RunEnd::Completed => {
                debug!(run = self.id, items = admitted, "Stream run completed");
            }
            RunEnd::Aborted(reason) => {
                info!(
                    run = self.id,
                    items = admitted,
                    dropped = dropped,
                    reason = %reason,
                    "Stream run aborted"
                );
                let _ = self
                    .results
                    .send(Err(ResilienceError::StreamAborted(reason)))
                    .await;
            }
            RunEnd::TimedOut(limit) => {
                self.counters.record_timeout();
                self.cancel.cancel("stream timed out");
                warn!(
                    run = self.id,
                    items = admitted,
                    dropped = dropped,
                    timeout_ms = limit.as_millis() as u64,
                    "Stream run timed out"
                );
                let _ = self
                    .results
                    .send(Err(ResilienceError::timeout(
                        format!("stream-run-{}", self.id),
                        limit,
                    )))
                    .await;
            }
            RunEnd::ItemFailed(index) => {
                self.cancel.cancel(format!("item {index} failed"));
            }
            RunEnd::Abandoned => {
                self.cancel.cancel("result stream dropped");
                debug!(run = self.id, dropped = dropped, "Stream run abandoned by consumer");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_item<T, F, Fut, R>(
    item_fn: Arc<F>,
    item: T,
    index: usize,
    retained: Option<T>,
    signal: CancellationSignal,
    timeouts: TimeoutManager,
    item_timeout: Option<Duration>,
    context: Arc<TimeoutContext>,
) -> impl Future<Output = ItemOutcome<T, R>>
where
    F: Fn(T, usize, CancellationSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let work = AssertUnwindSafe(async move { item_fn(item, index, signal).await }).catch_unwind();

    async move {
        let guarded = async {
            match work.await {
                Ok(result) => result.map_err(ResilienceError::upstream),
                Err(payload) => Err(ResilienceError::upstream(anyhow::anyhow!(
                    "stream item function panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            }
        };

        let outcome = match item_timeout {
            Some(limit) => {
                let options =
                    TimeoutOptions::named(format!("stream-item-{index}")).in_context(&context);
                timeouts
                    .wrap_with_timeout(guarded, limit, options)
                    .await
                    .and_then(|result| result)
            }
            None => guarded.await,
        };
        (index, retained, outcome)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Results of one run, in completion order.
///
/// Dropping the stream cancels the run.
pub struct ResultStream<R> {
    receiver: mpsc::Receiver<ResilienceResult<R>>,
    cancel: CancellationSource,
    counters: Arc<StreamCounters>,
    driver: JoinHandle<()>,
}

impl<R> ResultStream<R> {
    /// Stop admitting items and end the run with a `StreamAborted` error.
    /// Only the first call has any effect.
    pub fn abort(&self, reason: &str) -> bool {
        self.cancel.cancel(reason)
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal shared with the item functions of this run
    pub fn signal(&self) -> CancellationSignal {
        self.cancel.signal()
    }

    /// Counters of the processor that started this run
    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }
}

impl<R> Unpin for ResultStream<R> {}

impl<R> Stream for ResultStream<R> {
    type Item = ResilienceResult<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<R> Drop for ResultStream<R> {
    fn drop(&mut self) {
        self.cancel.cancel("result stream dropped");
    }
}

impl<R> fmt::Debug for ResultStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("aborted", &self.is_aborted())
            .field("finished", &self.is_finished())
            .finish()
    }
}
