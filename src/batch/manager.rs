//! # Batch Manager
//!
//! Collects individually submitted items into groups and hands each group to
//! a [`BatchProcessor`] in one call.
//!
//! ## Triggering
//!
//! - An `add` that brings the queue to `max_batch_size` dispatches immediately.
//! - The first item of an empty queue arms a `max_wait_time` timer. When it
//!   fires, the queue is dispatched if it holds at least `min_batch_size`
//!   items (or its oldest item is older than `max_queue_age`); otherwise the
//!   timer is re-armed and nothing is dropped.
//!
//! Group extraction is guarded by a processing flag; extracted groups go
//! through a FIFO channel to a dispatcher task that admits at most
//! `concurrency` groups at once. Each group makes at most one
//! `process_batch` call (plus configured retries).

use super::config::{BatchConfig, ErrorHandlingStrategy};
use super::processor::BatchProcessor;
use super::stats::{BatchCounters, BatchItemError, BatchStats};
use crate::error::{ResilienceError, ResilienceResult};
use crate::logging::log_resilience_operation;
use crate::retry::{with_retry, RetryPolicy};
use crate::timeout::{TimeoutContext, TimeoutManager, TimeoutOptions};
use futures::future::{try_join_all, TryJoinAll};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-item submission options
#[derive(Debug, Clone, Default)]
pub struct ItemOptions {
    /// Caller-supplied submission id; a UUID is generated when absent
    pub id: Option<String>,
    pub priority: Option<i32>,
}

impl ItemOptions {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            priority: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

struct ItemSlot<O> {
    id: String,
    priority: Option<i32>,
    responder: oneshot::Sender<ResilienceResult<O>>,
}

impl<O> ItemSlot<O> {
    fn settle(self, result: ResilienceResult<O>) {
        // A dropped ticket just means nobody is waiting for this item
        let _ = self.responder.send(result);
    }
}

struct QueuedItem<I, O> {
    slot: ItemSlot<O>,
    payload: I,
    enqueued_at: Instant,
}

type Group<P> = Vec<QueuedItem<<P as BatchProcessor>::Item, <P as BatchProcessor>::Output>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchTrigger {
    SizeReached,
    TimerElapsed,
    QueueAgeExceeded,
    Flush,
}

impl DispatchTrigger {
    /// Smallest partial group the first extraction may take
    fn partial_floor(self, min_batch_size: usize) -> Option<usize> {
        match self {
            DispatchTrigger::SizeReached => None,
            DispatchTrigger::TimerElapsed => Some(min_batch_size),
            DispatchTrigger::QueueAgeExceeded | DispatchTrigger::Flush => Some(1),
        }
    }

    fn rank(self) -> u8 {
        match self {
            DispatchTrigger::SizeReached => 0,
            DispatchTrigger::TimerElapsed => 1,
            DispatchTrigger::QueueAgeExceeded => 2,
            DispatchTrigger::Flush => 3,
        }
    }
}

struct BatchState<I, O> {
    queue: VecDeque<QueuedItem<I, O>>,
    timer: Option<(u64, JoinHandle<()>)>,
    next_timer_id: u64,
    accepting: bool,
    /// Dispatch requested while another caller held the extraction flag
    pending: Option<DispatchTrigger>,
}

impl<I, O> BatchState<I, O> {
    fn request_dispatch(&mut self, trigger: DispatchTrigger) {
        if self.pending.map_or(true, |pending| trigger.rank() > pending.rank()) {
            self.pending = Some(trigger);
        }
    }

    fn cancel_timer(&mut self) {
        if let Some((_, timer)) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Shared<P: BatchProcessor> {
    name: String,
    config: BatchConfig,
    processor: P,
    state: Mutex<BatchState<P::Item, P::Output>>,
    processing: AtomicBool,
    groups: mpsc::UnboundedSender<Group<P>>,
    in_flight: watch::Sender<usize>,
    counters: BatchCounters,
    collected: Mutex<Vec<BatchItemError>>,
    timeouts: TimeoutManager,
    timeout_context: TimeoutContext,
}

impl<P: BatchProcessor> Shared<P> {
    fn shutting_down(&self) -> ResilienceError {
        ResilienceError::ShuttingDown {
            batch: self.name.clone(),
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut BatchState<P::Item, P::Output>) {
        let timer_id = state.next_timer_id;
        state.next_timer_id += 1;

        let weak = Arc::downgrade(self);
        let deadline = Instant::now() + self.config.max_wait_time;
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_timer_elapsed(timer_id);
            }
        });
        state.timer = Some((timer_id, timer));
    }

    fn on_timer_elapsed(self: &Arc<Self>, timer_id: u64) {
        let trigger = {
            let mut state = self.state.lock();
            match &state.timer {
                Some((current, _)) if *current == timer_id => {}
                _ => return,
            }
            state.timer = None;

            let Some(oldest) = state.queue.front() else {
                return;
            };
            let queued = state.queue.len();
            let oldest_age = oldest.enqueued_at.elapsed();

            if queued >= self.config.min_batch_size {
                DispatchTrigger::TimerElapsed
            } else if self
                .config
                .max_queue_age
                .is_some_and(|max_age| oldest_age >= max_age)
            {
                warn!(
                    batch = %self.name,
                    queued = queued,
                    min_batch_size = self.config.min_batch_size,
                    oldest_age_ms = oldest_age.as_millis() as u64,
                    "Queue age exceeded; dispatching below minimum batch size"
                );
                DispatchTrigger::QueueAgeExceeded
            } else {
                debug!(
                    batch = %self.name,
                    queued = queued,
                    min_batch_size = self.config.min_batch_size,
                    "Wait time elapsed below minimum batch size; re-arming timer"
                );
                self.arm_timer(&mut state);
                return;
            }
        };

        self.dispatch(trigger);
    }

    /// Extract ready groups and submit them. Returns the number of items dispatched.
    fn dispatch(self: &Arc<Self>, trigger: DispatchTrigger) -> usize {
        let max = self.config.max_batch_size;
        let mut drain_all = trigger == DispatchTrigger::Flush;
        let mut partial_floor = trigger.partial_floor(self.config.min_batch_size);
        let mut request = Some(trigger);
        let mut dispatched = 0;

        loop {
            if self.processing.swap(true, Ordering::AcqRel) {
                let Some(request) = request.take() else {
                    return dispatched;
                };
                // The active extractor takes pending requests before releasing the flag
                self.state.lock().request_dispatch(request);
                if self.processing.swap(true, Ordering::AcqRel) {
                    return dispatched;
                }
            }
            request = None;

            let groups = {
                let mut state = self.state.lock();
                if let Some(pending) = state.pending.take() {
                    drain_all |= pending == DispatchTrigger::Flush;
                    let requested = pending.partial_floor(self.config.min_batch_size);
                    partial_floor = match (partial_floor, requested) {
                        (Some(current), Some(requested)) => Some(current.min(requested)),
                        (current, requested) => current.or(requested),
                    };
                }
                let mut groups: Vec<Group<P>> = Vec::new();
                loop {
                    let queued = state.queue.len();
                    let take = if queued >= max {
                        max
                    } else if queued > 0 && partial_floor.is_some_and(|floor| queued >= floor) {
                        queued
                    } else {
                        break;
                    };
                    groups.push(state.queue.drain(..take).collect());
                    partial_floor = if drain_all { Some(1) } else { None };
                }
                if state.queue.is_empty() {
                    state.cancel_timer();
                }
                groups
            };

            for group in groups {
                dispatched += group.len();
                self.submit(group, trigger);
            }

            self.processing.store(false, Ordering::Release);

            let mut state = self.state.lock();
            if state.queue.len() < max && state.pending.is_none() {
                if !state.queue.is_empty() && state.timer.is_none() && state.accepting {
                    self.arm_timer(&mut state);
                }
                return dispatched;
            }
        }
    }

    fn submit(&self, group: Group<P>, trigger: DispatchTrigger) {
        let group_size = group.len();
        self.counters.record_dispatch(group_size);
        self.in_flight.send_modify(|count| *count += 1);

        debug!(
            batch = %self.name,
            group_size = group_size,
            trigger = ?trigger,
            "Dispatching batch group"
        );

        if let Err(mpsc::error::SendError(group)) = self.groups.send(group) {
            self.in_flight
                .send_modify(|count| *count = count.saturating_sub(1));
            self.reject_queued(group, self.shutting_down());
        }
    }

    async fn process_group(&self, group: Group<P>) {
        let group_size = group.len();
        let started = Instant::now();
        let (slots, payloads): (Vec<ItemSlot<P::Output>>, Vec<P::Item>) = group
            .into_iter()
            .map(|item| (item.slot, item.payload))
            .unzip();

        let fallback_items = (self.config.error_handling.falls_back_to_items()
            && self.processor.supports_item_fallback())
        .then(|| payloads.clone());

        match self.run_process_batch(payloads).await {
            Ok(results) if results.len() == group_size => {
                for (slot, result) in slots.into_iter().zip(results) {
                    self.counters.record_success();
                    slot.settle(Ok(result));
                }
                debug!(
                    batch = %self.name,
                    group_size = group_size,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Batch group processed"
                );
            }
            Ok(results) => {
                error!(
                    batch = %self.name,
                    expected = group_size,
                    actual = results.len(),
                    "Batch processor returned the wrong number of results"
                );
                self.reject_group(
                    slots,
                    ResilienceError::ResultCountMismatch {
                        expected: group_size,
                        actual: results.len(),
                    },
                );
            }
            Err(batch_error) => match fallback_items {
                Some(items) => {
                    warn!(
                        batch = %self.name,
                        group_size = group_size,
                        error = %batch_error,
                        "Batch failed; processing items individually"
                    );
                    self.process_individually(slots, items).await;
                }
                None => {
                    warn!(
                        batch = %self.name,
                        group_size = group_size,
                        error = %batch_error,
                        strategy = ?self.config.error_handling,
                        "Batch failed; rejecting every item in the group"
                    );
                    self.reject_group(slots, batch_error);
                }
            },
        }
    }

    async fn run_process_batch(&self, payloads: Vec<P::Item>) -> ResilienceResult<Vec<P::Output>> {
        let Some(retry) = &self.config.retry else {
            return self.process_once(payloads).await;
        };

        let policy = RetryPolicy::<ResilienceError>::new(retry.clone())
            .with_should_retry(|error, _attempt| error.is_retryable());
        let outcome = with_retry(|_attempt| self.process_once(payloads.clone()), &policy).await;

        if outcome.attempts > 1 {
            debug!(
                batch = %self.name,
                attempts = outcome.attempts,
                success = outcome.is_success(),
                "Batch processed with retries"
            );
        }
        outcome.into_result()
    }

    async fn process_once(&self, payloads: Vec<P::Item>) -> ResilienceResult<Vec<P::Output>> {
        let call = self.processor.process_batch(payloads);
        let result = match self.config.batch_timeout {
            Some(limit) => {
                self.timeouts
                    .wrap_with_timeout(
                        call,
                        limit,
                        TimeoutOptions::named(format!("batch:{}", self.name))
                            .in_context(&self.timeout_context),
                    )
                    .await?
            }
            None => call.await,
        };
        result.map_err(ResilienceError::upstream)
    }

    async fn process_individually(&self, slots: Vec<ItemSlot<P::Output>>, items: Vec<P::Item>) {
        for (slot, item) in slots.into_iter().zip(items) {
            match self.processor.process_item(item).await {
                Ok(output) => {
                    self.counters.record_success();
                    slot.settle(Ok(output));
                }
                Err(err) => {
                    let error = ResilienceError::upstream(err);
                    self.record_item_failure(&slot, &error);
                    slot.settle(Err(error));
                }
            }
        }
    }

    fn reject_group(&self, slots: Vec<ItemSlot<P::Output>>, error: ResilienceError) {
        for slot in slots {
            self.record_item_failure(&slot, &error);
            slot.settle(Err(error.clone()));
        }
    }

    fn record_item_failure(&self, slot: &ItemSlot<P::Output>, error: &ResilienceError) {
        self.counters.record_failures(1);
        if self.config.error_handling == ErrorHandlingStrategy::CollectErrors {
            self.collected.lock().push(BatchItemError {
                item_id: slot.id.clone(),
                priority: slot.priority,
                error: error.clone(),
                failed_at: chrono::Utc::now(),
            });
        }
    }

    /// Reject items that never reached the processor
    fn reject_queued(&self, items: Group<P>, error: ResilienceError) -> usize {
        let count = items.len();
        self.counters.record_failures(count);
        for item in items {
            item.slot.settle(Err(error.clone()));
        }
        count
    }
}

async fn run_dispatcher<P: BatchProcessor>(
    weak: Weak<Shared<P>>,
    mut groups: mpsc::UnboundedReceiver<Group<P>>,
    permits: Arc<Semaphore>,
) {
    while let Some(group) = groups.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(shared) = weak.upgrade() else {
            break;
        };

        tokio::spawn(async move {
            if AssertUnwindSafe(shared.process_group(group))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(batch = %shared.name, "Batch processor panicked; group abandoned");
            }
            drop(permit);
            shared
                .in_flight
                .send_modify(|count| *count = count.saturating_sub(1));
        });
    }
}

/// Collects items into groups for a [`BatchProcessor`]. Cheap to clone.
pub struct BatchManager<P: BatchProcessor> {
    shared: Arc<Shared<P>>,
}

impl<P: BatchProcessor> BatchManager<P> {
    /// Create a manager with a private timeout manager.
    ///
    /// Must be called from within a tokio runtime; the dispatcher is a spawned task.
    pub fn new(name: impl Into<String>, config: BatchConfig, processor: P) -> ResilienceResult<Self> {
        Self::with_timeout_manager(name, config, processor, TimeoutManager::default())
    }

    pub fn with_timeout_manager(
        name: impl Into<String>,
        config: BatchConfig,
        processor: P,
        timeouts: TimeoutManager,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        let name = name.into();

        let (group_sender, group_receiver) = mpsc::unbounded_channel();
        let (in_flight, _) = watch::channel(0usize);
        let permits = Arc::new(Semaphore::new(config.concurrency));
        let timeout_context = timeouts.create_context(format!("batch:{name}"));

        info!(
            batch = %name,
            max_batch_size = config.max_batch_size,
            min_batch_size = config.min_batch_size,
            max_wait_ms = config.max_wait_time.as_millis() as u64,
            concurrency = config.concurrency,
            error_handling = ?config.error_handling,
            "Batch manager created"
        );

        let shared = Arc::new(Shared {
            name,
            config,
            processor,
            state: Mutex::new(BatchState {
                queue: VecDeque::new(),
                timer: None,
                next_timer_id: 0,
                accepting: true,
                pending: None,
            }),
            processing: AtomicBool::new(false),
            groups: group_sender,
            in_flight,
            counters: BatchCounters::default(),
            collected: Mutex::new(Vec::new()),
            timeouts,
            timeout_context,
        });

        tokio::spawn(run_dispatcher(
            Arc::downgrade(&shared),
            group_receiver,
            permits,
        ));

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Queue an item; the returned ticket resolves with its result
    pub fn add(&self, item: P::Item) -> BatchTicket<P::Output> {
        self.add_with(item, ItemOptions::default())
    }

    pub fn add_with(&self, item: P::Item, options: ItemOptions) -> BatchTicket<P::Output> {
        let (responder, receiver) = oneshot::channel();
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let ticket = BatchTicket {
            id: id.clone(),
            batch: self.shared.name.clone(),
            receiver,
        };
        let queued = QueuedItem {
            slot: ItemSlot {
                id,
                priority: options.priority,
                responder,
            },
            payload: item,
            enqueued_at: Instant::now(),
        };

        let size_reached = {
            let mut state = self.shared.state.lock();
            if !state.accepting {
                drop(state);
                queued.slot.settle(Err(self.shared.shutting_down()));
                return ticket;
            }

            state.queue.push_back(queued);
            self.shared.counters.record_submitted();

            if state.queue.len() >= self.shared.config.max_batch_size {
                true
            } else {
                if state.timer.is_none() {
                    self.shared.arm_timer(&mut state);
                }
                false
            }
        };

        if size_reached {
            self.shared.dispatch(DispatchTrigger::SizeReached);
        }
        ticket
    }

    /// Queue several items; resolves with all results or the first error
    pub fn add_many<It>(&self, items: It) -> TryJoinAll<BatchTicket<P::Output>>
    where
        It: IntoIterator<Item = P::Item>,
    {
        try_join_all(items.into_iter().map(|item| self.add(item)))
    }

    /// Dispatch everything queued now, ignoring `min_batch_size`
    pub fn flush(&self) -> usize {
        self.shared.dispatch(DispatchTrigger::Flush)
    }

    /// Reject every queued item with `BatchCleared`
    pub fn clear(&self) -> usize {
        let items: Group<P> = {
            let mut state = self.shared.state.lock();
            state.cancel_timer();
            state.queue.drain(..).collect()
        };
        let cleared = self.shared.reject_queued(
            items,
            ResilienceError::BatchCleared {
                batch: self.shared.name.clone(),
            },
        );
        if cleared > 0 {
            info!(batch = %self.shared.name, cleared = cleared, "Batch queue cleared");
        }
        cleared
    }

    /// Stop accepting items, wait for in-flight groups, then reject whatever is
    /// still queued. Returns the number of rejected items.
    pub async fn shutdown(&self) -> usize {
        {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            state.cancel_timer();
        }
        info!(batch = %self.shared.name, "Batch manager shutting down; draining in-flight groups");

        let mut in_flight = self.shared.in_flight.subscribe();
        if in_flight.wait_for(|count| *count == 0).await.is_err() {
            warn!(batch = %self.shared.name, "In-flight tracking closed during shutdown");
        }

        let items: Group<P> = self.shared.state.lock().queue.drain(..).collect();
        let rejected = self.shared.reject_queued(items, self.shared.shutting_down());
        self.shared.timeout_context.cleanup();

        let stats = self.stats();
        log_resilience_operation(
            &self.shared.name,
            "batch_shutdown",
            "completed",
            Some(&format!(
                "submitted={} succeeded={} failed={} rejected={rejected}",
                stats.submitted, stats.succeeded, stats.failed
            )),
        );
        rejected
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().accepting
    }

    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn stats(&self) -> BatchStats {
        let queued = self.queued_len();
        let in_flight_groups = *self.shared.in_flight.borrow();
        self.shared.counters.snapshot(queued, in_flight_groups)
    }

    /// Take the item failures recorded under `collect-errors`
    pub fn collected_errors(&self) -> Vec<BatchItemError> {
        std::mem::take(&mut *self.shared.collected.lock())
    }

    /// A plain function submitting to this manager
    pub fn callable(&self) -> impl Fn(P::Item) -> BatchTicket<P::Output> + Clone + Send + Sync + 'static {
        let manager = self.clone();
        move |item| manager.add(item)
    }
}

impl<P: BatchProcessor> Clone for BatchManager<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: BatchProcessor> fmt::Debug for BatchManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchManager")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Pending result of one submitted item
#[derive(Debug)]
pub struct BatchTicket<O> {
    id: String,
    batch: String,
    receiver: oneshot::Receiver<ResilienceResult<O>>,
}

impl<O> BatchTicket<O> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<O> Future for BatchTicket<O> {
    type Output = ResilienceResult<O>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ResilienceError::aborted(
                    &this.batch,
                    "item dropped before it was processed",
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingProcessor {
        calls: Mutex<Vec<Vec<u32>>>,
        fail_batches: bool,
        item_fallback: bool,
        drop_last_result: bool,
        delay: Option<Duration>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl RecordingProcessor {
        fn calls(&self) -> Vec<Vec<u32>> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl BatchProcessor for RecordingProcessor {
        type Item = u32;
        type Output = u32;

        async fn process_batch(&self, items: Vec<u32>) -> anyhow::Result<Vec<u32>> {
            self.calls.lock().push(items.clone());
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail_batches {
                anyhow::bail!("downstream rejected the batch");
            }
            let mut results: Vec<u32> = items.iter().map(|n| n * 10).collect();
            if self.drop_last_result {
                results.pop();
            }
            Ok(results)
        }

        fn supports_item_fallback(&self) -> bool {
            self.item_fallback
        }

        async fn process_item(&self, item: u32) -> anyhow::Result<u32> {
            if item % 2 == 1 {
                anyhow::bail!("odd item {item} rejected");
            }
            Ok(item * 10)
        }
    }

    async fn settle_tasks() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn config(max_batch_size: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            max_wait_time: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_dispatches_without_waiting() {
        let processor = Arc::new(RecordingProcessor::default());
        let manager = BatchManager::new("orders", config(2), Arc::clone(&processor)).unwrap();
        let started = Instant::now();

        let first = manager.add(1);
        let second = manager.add(2);

        assert_eq!(first.await.unwrap(), 10);
        assert_eq!(second.await.unwrap(), 20);
        assert_eq!(processor.calls(), vec![vec![1, 2]]);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_respects_minimum_batch_size() {
        let processor = Arc::new(RecordingProcessor::default());
        let manager = BatchManager::new(
            "events",
            BatchConfig {
                max_batch_size: 10,
                min_batch_size: 3,
                max_wait_time: Duration::from_millis(1000),
                ..Default::default()
            },
            Arc::clone(&processor),
        )
        .unwrap();

        let first = manager.add(1);
        tokio::time::advance(Duration::from_millis(1000)).await;
        settle_tasks().await;
        assert!(processor.calls().is_empty());
        assert_eq!(manager.queued_len(), 1);

        let second = manager.add(2);
        let third = manager.add(3);
        tokio::time::advance(Duration::from_millis(1000)).await;
        settle_tasks().await;

        assert_eq!(processor.calls(), vec![vec![1, 2, 3]]);
        assert_eq!(first.await.unwrap(), 10);
        assert_eq!(second.await.unwrap(), 20);
        assert_eq!(third.await.unwrap(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_age_overrides_minimum() {
        let processor = Arc::new(RecordingProcessor::default());
        let manager = BatchManager::new(
            "sparse",
            BatchConfig {
                max_batch_size: 10,
                min_batch_size: 5,
                max_wait_time: Duration::from_millis(100),
                max_queue_age: Some(Duration::from_millis(250)),
                ..Default::default()
            },
            Arc::clone(&processor),
        )
        .unwrap();
        let started = Instant::now();

        assert_eq!(manager.add(7).await.unwrap(), 70);
        assert_eq!(processor.calls(), vec![vec![7]]);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_rejects_whole_group() {
        let processor = Arc::new(RecordingProcessor {
            fail_batches: true,
            item_fallback: true,
            ..Default::default()
        });
        let manager = BatchManager::new("strict", config(2), processor).unwrap();

        let a = manager.add(2);
        let b = manager.add(4);
        for ticket in [a, b] {
            let err = ticket.await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Upstream);
            assert_eq!(err.to_string(), "downstream rejected the batch");
        }
        assert_eq!(manager.stats().failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_falls_back_to_items() {
        let processor = Arc::new(RecordingProcessor {
            fail_batches: true,
            item_fallback: true,
            ..Default::default()
        });
        let manager = BatchManager::new(
            "lenient",
            BatchConfig {
                error_handling: ErrorHandlingStrategy::Continue,
                ..config(3)
            },
            processor,
        )
        .unwrap();

        let results = futures::future::join_all([manager.add(2), manager.add(3), manager.add(4)]).await;
        assert_eq!(results[0].as_ref().unwrap(), &20);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &40);
        assert!(manager.collected_errors().is_empty());

        let stats = manager.stats();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_without_fallback_rejects_all() {
        let processor = Arc::new(RecordingProcessor {
            fail_batches: true,
            ..Default::default()
        });
        let manager = BatchManager::new(
            "no-fallback",
            BatchConfig {
                error_handling: ErrorHandlingStrategy::Continue,
                ..config(2)
            },
            processor,
        )
        .unwrap();

        let results = futures::future::join_all([manager.add(2), manager.add(4)]).await;
        assert!(results.iter().all(|result| result.is_err()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_errors_records_item_failures() {
        let processor = Arc::new(RecordingProcessor {
            fail_batches: true,
            item_fallback: true,
            ..Default::default()
        });
        let manager = BatchManager::new(
            "collector",
            BatchConfig {
                error_handling: ErrorHandlingStrategy::CollectErrors,
                ..config(2)
            },
            processor,
        )
        .unwrap();

        let odd = manager.add_with(1, ItemOptions::with_id("item-1").priority(5));
        let even = manager.add(2);
        assert!(odd.await.is_err());
        assert_eq!(even.await.unwrap(), 20);

        let errors = manager.collected_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].item_id, "item-1");
        assert_eq!(errors[0].priority, Some(5));
        assert!(manager.collected_errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_count_mismatch_rejects_group() {
        let processor = Arc::new(RecordingProcessor {
            drop_last_result: true,
            ..Default::default()
        });
        let manager = BatchManager::new("broken", config(2), processor).unwrap();

        let results = futures::future::join_all([manager.add(1), manager.add(2)]).await;
        for result in results {
            assert!(matches!(
                result,
                Err(ResilienceError::ResultCountMismatch {
                    expected: 2,
                    actual: 1
                })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_and_clear() {
        let processor = Arc::new(RecordingProcessor::default());
        let manager = BatchManager::new(
            "manual",
            BatchConfig {
                min_batch_size: 5,
                ..config(10)
            },
            Arc::clone(&processor),
        )
        .unwrap();

        let flushed = manager.add(1);
        assert_eq!(manager.flush(), 1);
        assert_eq!(flushed.await.unwrap(), 10);

        let cleared = manager.add(2);
        assert_eq!(manager.clear(), 1);
        assert_eq!(cleared.await.unwrap_err().kind(), ErrorKind::BatchCleared);
        assert_eq!(processor.calls(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_during_active_extraction_is_honoured() {
        let processor = Arc::new(RecordingProcessor::default());
        let manager = BatchManager::new(
            "contended",
            BatchConfig {
                min_batch_size: 5,
                ..config(10)
            },
            Arc::clone(&processor),
        )
        .unwrap();

        let queued = manager.add(1);
        manager.shared.processing.store(true, Ordering::SeqCst);
        assert_eq!(manager.flush(), 0);
        assert_eq!(manager.queued_len(), 1);

        // The extractor holding the flag finishes and re-checks the queue
        manager.shared.processing.store(false, Ordering::SeqCst);
        assert_eq!(manager.shared.dispatch(DispatchTrigger::SizeReached), 1);

        assert_eq!(queued.await.unwrap(), 10);
        assert_eq!(processor.calls(), vec![vec![1]]);
        assert!(manager.shared.state.lock().pending.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_and_rejects_queued() {
        let processor = Arc::new(RecordingProcessor {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let manager = BatchManager::new(
            "draining",
            BatchConfig {
                min_batch_size: 2,
                ..config(2)
            },
            Arc::clone(&processor),
        )
        .unwrap();

        let in_flight = manager.add_many([1, 2]);
        let queued = manager.add(3);
        settle_tasks().await;

        assert_eq!(manager.shutdown().await, 1);
        assert_eq!(in_flight.await.unwrap(), vec![10, 20]);
        assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::ShuttingDown);
        assert_eq!(
            manager.add(4).await.unwrap_err().kind(),
            ErrorKind::ShuttingDown
        );
        assert!(!manager.is_accepting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounds_in_flight_groups() {
        let processor = Arc::new(RecordingProcessor {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let manager = BatchManager::new(
            "parallel",
            BatchConfig {
                concurrency: 2,
                ..config(1)
            },
            Arc::clone(&processor),
        )
        .unwrap();

        let results = manager.add_many([1, 2, 3, 4]).await.unwrap();
        assert_eq!(results, vec![10, 20, 30, 40]);
        assert_eq!(processor.max_running.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().dispatched_groups, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_rejects_group() {
        let processor = Arc::new(RecordingProcessor {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let manager = BatchManager::new(
            "slow",
            BatchConfig {
                batch_timeout: Some(Duration::from_millis(50)),
                ..config(1)
            },
            processor,
        )
        .unwrap();

        assert!(manager.add(1).await.unwrap_err().is_timeout());
    }

    #[derive(Debug, Default)]
    struct FlakyProcessor {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BatchProcessor for FlakyProcessor {
        type Item = u32;
        type Output = u32;

        async fn process_batch(&self, items: Vec<u32>) -> anyhow::Result<Vec<u32>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("connection reset by peer");
            }
            Ok(items)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_transient_batch_failure() {
        let processor = Arc::new(FlakyProcessor::default());
        let manager = BatchManager::new(
            "retrying",
            BatchConfig {
                retry: Some(RetryConfig {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    ..Default::default()
                }),
                ..config(1)
            },
            Arc::clone(&processor),
        )
        .unwrap();

        assert_eq!(manager.add(9).await.unwrap(), 9);
        assert_eq!(processor.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callable_submits_to_manager() {
        let processor = Arc::new(RecordingProcessor::default());
        let manager = BatchManager::new("callable", config(1), processor).unwrap();
        let submit = manager.callable();

        assert_eq!(submit(5).await.unwrap(), 50);
        assert_eq!(manager.stats().submitted, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = BatchManager::new(
            "bad",
            BatchConfig {
                max_batch_size: 0,
                ..Default::default()
            },
            RecordingProcessor::default(),
        );
        assert!(result.is_err());
    }
}
