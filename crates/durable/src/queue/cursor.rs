//! Paginated, re-pollable queue cursor
//!
//! A cursor runs one bounded query, hands out the rows one by one, and can
//! be rewound to re-issue the query from scratch. Rewinding is how the
//! engine picks up rows that producers appended after iteration began:
//!
//! ```text
//! open ──▶ next … next (page exhausted) ──▶ rewind ──▶ has_items? ──┐
//!            ▲                                                      │ yes
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! Rows are always fetched in ascending id order, so repeated re-polling
//! drains the oldest work first.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::persistence::{AtomicRecord, StoreError, TaskStore};

/// Default number of rows fetched per query
pub const DEFAULT_PAGE_SIZE: usize = 100;

type FetchPage<T> =
    Box<dyn FnMut(usize) -> BoxFuture<'static, Result<Vec<T>, StoreError>> + Send>;

/// Cursor over the pending rows of one queue
pub struct QueueCursor<T> {
    fetch: FetchPage<T>,
    page_size: usize,
    page: Vec<T>,
    position: usize,
}

impl<T: Send + 'static> QueueCursor<T> {
    /// Run the first query
    ///
    /// `fetch` receives the page size and returns at most that many pending
    /// rows in ascending id order.
    pub async fn open<F, Fut>(page_size: usize, mut fetch: F) -> Result<Self, StoreError>
    where
        F: FnMut(usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, StoreError>> + Send + 'static,
    {
        let mut cursor = Self {
            fetch: Box::new(move |limit: usize| fetch(limit).boxed()),
            page_size: page_size.max(1),
            page: Vec::new(),
            position: 0,
        };
        cursor.rewind().await?;
        Ok(cursor)
    }

    /// Like [`open`](Self::open), mapping each fetched row to a domain value
    pub async fn mapped<R, F, Fut, M>(
        page_size: usize,
        mut fetch: F,
        map: M,
    ) -> Result<Self, StoreError>
    where
        R: Send + 'static,
        F: FnMut(usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<R>, StoreError>> + Send + 'static,
        M: Fn(R) -> T + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        Self::open(page_size, move |limit| {
            let rows = fetch(limit);
            let map = Arc::clone(&map);
            async move {
                let rows = rows.await?;
                Ok::<Vec<T>, StoreError>(rows.into_iter().map(|row| map(row)).collect())
            }
        })
        .await
    }

    /// Whether the last query returned at least one row
    pub fn has_items(&self) -> bool {
        !self.page.is_empty()
    }

    /// Advance to the next row of the current page
    ///
    /// Returns `None` once the page is exhausted; call [`rewind`](Self::rewind)
    /// to look for more.
    pub fn next(&mut self) -> Option<&mut T> {
        let item = self.page.get_mut(self.position)?;
        self.position += 1;
        Some(item)
    }

    /// The row last returned by [`next`](Self::next)
    pub fn current(&self) -> Option<&T> {
        self.position.checked_sub(1).and_then(|i| self.page.get(i))
    }

    /// Rows consumed from the current page
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Re-issue the query from scratch
    pub async fn rewind(&mut self) -> Result<(), StoreError> {
        self.page = (self.fetch)(self.page_size).await?;
        self.position = 0;
        Ok(())
    }
}

impl QueueCursor<AtomicRecord> {
    /// Cursor over the queued atomics of one subtask
    pub async fn pending_atomics(
        store: Arc<dyn TaskStore>,
        subtask_id: i64,
        page_size: usize,
    ) -> Result<Self, StoreError> {
        Self::open(page_size, move |limit| {
            let store = Arc::clone(&store);
            async move { store.pending_atomics(subtask_id, limit).await }
        })
        .await
    }
}
