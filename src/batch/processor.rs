//! # Batch Processors
//!
//! The caller-supplied business function behind a [`BatchManager`](super::BatchManager).

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

/// Processes a group of items in one call.
///
/// `process_batch` must return exactly one output per input, in input order.
/// Processors that can also handle a single item should override both
/// `supports_item_fallback` and `process_item`; the manager then retries a
/// failed group item by item under the `continue`/`collect-errors` strategies.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;
    type Output: Send + 'static;

    async fn process_batch(&self, items: Vec<Self::Item>) -> anyhow::Result<Vec<Self::Output>>;

    fn supports_item_fallback(&self) -> bool {
        false
    }

    async fn process_item(&self, _item: Self::Item) -> anyhow::Result<Self::Output> {
        Err(anyhow::anyhow!("process_item is not implemented by this processor"))
    }
}

#[async_trait]
impl<P: BatchProcessor> BatchProcessor for std::sync::Arc<P> {
    type Item = P::Item;
    type Output = P::Output;

    async fn process_batch(&self, items: Vec<Self::Item>) -> anyhow::Result<Vec<Self::Output>> {
        self.as_ref().process_batch(items).await
    }

    fn supports_item_fallback(&self) -> bool {
        self.as_ref().supports_item_fallback()
    }

    async fn process_item(&self, item: Self::Item) -> anyhow::Result<Self::Output> {
        self.as_ref().process_item(item).await
    }
}

/// Adapts an async closure into a [`BatchProcessor`] without item fallback
pub struct FnBatchProcessor<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnBatchProcessor<F, I, O> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

impl<F, I, O> fmt::Debug for FnBatchProcessor<F, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBatchProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, I, O> BatchProcessor for FnBatchProcessor<F, I, O>
where
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<O>>> + Send + 'static,
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    type Item = I;
    type Output = O;

    async fn process_batch(&self, items: Vec<I>) -> anyhow::Result<Vec<O>> {
        (self.f)(items).await
    }
}

/// Shorthand for [`FnBatchProcessor::new`]
pub fn batch_fn<F, Fut, I, O>(f: F) -> FnBatchProcessor<F, I, O>
where
    F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<O>>> + Send + 'static,
{
    FnBatchProcessor::new(f)
}
