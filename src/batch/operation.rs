//! Running one worker over a collection.

use std::future::Future;

use futures::future::join_all;

use super::BatchResult;

/// A collection waiting to be fanned out through a worker.
///
/// None of the run modes abort early: every item is attempted and every
/// outcome lands in the returned [`BatchResult`].
#[derive(Debug, Clone)]
pub struct BatchOperation<I> {
    items: Vec<I>,
}

impl<I> BatchOperation<I> {
    pub fn new(items: impl IntoIterator<Item = I>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Launch every worker at once and wait for all of them to settle.
    pub async fn run<F, Fut, T, E>(self, worker: F) -> BatchResult<T, E>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        BatchResult::from_outcomes(join_all(self.items.into_iter().map(worker)).await)
    }

    /// Settle chunks of at most `size` items, one chunk after another.
    ///
    /// A `size` of zero is treated as one.
    pub async fn run_chunked<F, Fut, T, E>(self, size: usize, worker: F) -> BatchResult<T, E>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let size = size.max(1);
        let mut batch = BatchResult::new();
        let mut items = self.items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<I> = items.by_ref().take(size).collect();
            let settled = join_all(chunk.into_iter().map(&worker)).await;
            batch = batch.combine(BatchResult::from_outcomes(settled));
        }
        batch
    }

    /// Await each worker before starting the next.
    pub async fn run_each<F, Fut, T, E>(self, worker: F) -> BatchResult<T, E>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut batch = BatchResult::new();
        for item in self.items {
            batch.push(worker(item).await);
        }
        batch
    }
}
