use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::error::ApiError;

pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

/// Type-erased snapshot of one cache entry.
#[derive(Clone)]
pub(crate) struct RawState {
    pub status: QueryStatus,
    pub data: Option<Payload>,
    pub error: Option<ApiError>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub is_fetching: bool,
    pub is_stale: bool,
}

impl Default for RawState {
    fn default() -> Self {
        Self {
            status: QueryStatus::Pending,
            data: None,
            error: None,
            last_fetched_at: None,
            is_fetching: false,
            is_stale: true,
        }
    }
}

impl RawState {
    pub(crate) fn typed<T>(&self) -> QueryState<T>
    where
        T: Send + Sync + 'static,
    {
        QueryState {
            status: self.status,
            // A payload of another type reads as absent.
            data: self.data.clone().and_then(|payload| payload.downcast::<T>().ok()),
            error: self.error.clone(),
            last_fetched_at: self.last_fetched_at,
            is_fetching: self.is_fetching,
            is_stale: self.is_stale,
        }
    }
}

/// What an observer sees for one key.
#[derive(Debug)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    /// Last successful value; kept through refetches and later errors.
    pub data: Option<Arc<T>>,
    pub error: Option<ApiError>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub is_fetching: bool,
    pub is_stale: bool,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            last_fetched_at: self.last_fetched_at,
            is_fetching: self.is_fetching,
            is_stale: self.is_stale,
        }
    }
}

impl<T> QueryState<T> {
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }
}

/// Live view of one cache key. Dropping it stops updates; in-flight requests keep running.
pub struct QueryObserver<T> {
    rx: watch::Receiver<RawState>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> QueryObserver<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(rx: watch::Receiver<RawState>) -> Self {
        Self {
            rx,
            _marker: PhantomData,
        }
    }

    pub fn current(&self) -> QueryState<T> {
        self.rx.borrow().typed()
    }

    /// Waits for the next update. Returns `None` once the entry is dropped from the cache.
    pub async fn changed(&mut self) -> Option<QueryState<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().typed())
    }

    /// Waits until `predicate` holds for the current or a later state.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&QueryState<T>) -> bool,
    ) -> Option<QueryState<T>> {
        let state = self
            .rx
            .wait_for(|raw| predicate(&raw.typed()))
            .await
            .ok()?
            .typed();
        Some(state)
    }

    pub fn into_stream(self) -> impl Stream<Item = QueryState<T>> {
        WatchStream::new(self.rx).map(|raw| raw.typed::<T>())
    }
}
