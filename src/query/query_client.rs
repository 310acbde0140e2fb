use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{ApiError, Result};

use super::query_state::{Payload, QueryObserver, QueryState, QueryStatus, RawState};

/// Structured cache key; equality is by value.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    type Family: Copy + Eq + Debug + Send + Sync + 'static;

    fn family(&self) -> Self::Family;
}

/// Retries apply to reads only, and only to transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Payload>>>;

struct CacheEntry {
    state: watch::Sender<RawState>,
    in_flight: Option<SharedFetch>,
    /// Bumped on every invalidation; a fetch started under an older epoch lands stale.
    epoch: u64,
}

impl CacheEntry {
    fn new() -> Self {
        let (state, _) = watch::channel(RawState::default());
        Self {
            state,
            in_flight: None,
            epoch: 0,
        }
    }

    fn fresh_data(&self) -> Option<Payload> {
        let state = self.state.borrow();
        match state.status {
            QueryStatus::Success if !state.is_stale => state.data.clone(),
            _ => None,
        }
    }
}

/// Key-based request cache with single-flight fetches and family invalidation.
pub struct QueryClient<K: CacheKey> {
    entries: Arc<DashMap<K, CacheEntry>>,
    /// Bumped by `clear`; fetches started under an older generation are discarded.
    generation: Arc<AtomicU64>,
    retry: RetryPolicy,
}

impl<K: CacheKey> Clone for QueryClient<K> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            generation: Arc::clone(&self.generation),
            retry: self.retry,
        }
    }
}

impl<K: CacheKey> QueryClient<K> {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            retry,
        }
    }

    /// Returns fresh cached data, joins the in-flight request for `key`, or starts one.
    ///
    /// The producer runs on a spawned task, so dropping this future does not
    /// cancel the request; its result still lands in the cache.
    pub async fn fetch<T, F, Fut>(&self, key: K, producer: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(CacheEntry::new);
            if let Some(data) = entry.fresh_data() {
                tracing::debug!("Cache hit for {:?}", key);
                return downcast(&key, data);
            }
            if let Some(pending) = entry.in_flight.clone() {
                tracing::debug!("Joining in-flight request for {:?}", key);
                pending
            } else {
                self.start_fetch::<T, F, Fut>(&key, entry.value_mut(), producer)
            }
        };

        let payload = pending.await?;
        downcast(&key, payload)
    }

    /// Forces a new request for `key` even when cached data is fresh.
    /// Observers keep the previous data until the new result lands.
    pub async fn refetch<T, F, Fut>(&self, key: K, producer: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.invalidate(&key);
        self.fetch(key, producer).await
    }

    /// Runs a write exactly once and, on success, invalidates `families`.
    pub async fn mutate<T, Fut>(&self, families: &[K::Family], mutation: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let client = self.clone();
        let families = families.to_vec();

        let task = tokio::spawn(async move {
            let outcome = mutation.await;
            if outcome.is_ok() {
                for family in families {
                    client.invalidate_family(family);
                }
            }
            outcome
        });

        task.await
            .unwrap_or_else(|e| Err(ApiError::Internal(format!("mutation task failed: {}", e))))
    }

    /// Any data held for `key`, fresh or stale.
    pub fn get_cached<T>(&self, key: &K) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.get(key)?;
        let data = entry.state.borrow().data.clone()?;
        data.downcast::<T>().ok()
    }

    pub fn state<T>(&self, key: &K) -> Option<QueryState<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.get(key)?;
        let state = entry.state.borrow().typed::<T>();
        Some(state)
    }

    pub fn subscribe<T>(&self, key: K) -> QueryObserver<T>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.entry(key).or_insert_with(CacheEntry::new);
        QueryObserver::new(entry.state.subscribe())
    }

    /// Marks `key` stale and detaches any in-flight request for it.
    pub fn invalidate(&self, key: &K) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            Self::invalidate_entry(key, entry.value_mut());
        }
    }

    pub fn invalidate_family(&self, family: K::Family) {
        let mut count = 0usize;
        for mut entry in self.entries.iter_mut() {
            if entry.key().family() == family {
                let key = entry.key().clone();
                Self::invalidate_entry(&key, entry.value_mut());
                count += 1;
            }
        }
        tracing::debug!("Invalidated {} entries of {:?}", count, family);
    }

    /// Drops every entry; observers see their channel close.
    /// Requests still in flight complete for their callers but never repopulate the cache.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        tracing::debug!("Query cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn invalidate_entry(key: &K, entry: &mut CacheEntry) {
        entry.epoch += 1;
        entry.in_flight = None;
        entry.state.send_modify(|state| {
            state.is_stale = true;
            state.is_fetching = false;
        });
        tracing::trace!("Invalidated {:?}", key);
    }

    fn start_fetch<T, F, Fut>(&self, key: &K, entry: &mut CacheEntry, producer: F) -> SharedFetch
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let epoch = entry.epoch;
        let started_in = self.generation.load(Ordering::SeqCst);
        let generation = Arc::clone(&self.generation);
        let entries = Arc::clone(&self.entries);
        let retry = self.retry;
        let task_key = key.clone();

        entry.state.send_modify(|state| {
            state.is_fetching = true;
            if state.data.is_none() {
                state.status = QueryStatus::Pending;
            }
        });

        tracing::debug!("Fetching {:?}", key);
        let task = tokio::spawn(async move {
            let outcome = run_with_retry(&task_key, retry, &producer)
                .await
                .map(|value| Arc::new(value) as Payload);
            settle(&entries, &generation, started_in, &task_key, epoch, &outcome);
            outcome
        });

        let pending = async move {
            task.await
                .unwrap_or_else(|e| Err(ApiError::Internal(format!("fetch task failed: {}", e))))
        }
        .boxed()
        .shared();

        entry.in_flight = Some(pending.clone());
        pending
    }
}

/// Applies a finished fetch. Results land in resolution order.
fn settle<K: CacheKey>(
    entries: &DashMap<K, CacheEntry>,
    generation: &AtomicU64,
    started_in: u64,
    key: &K,
    epoch: u64,
    outcome: &Result<Payload>,
) {
    let Some(mut entry) = entries.get_mut(key) else {
        tracing::debug!("Dropping result for evicted key {:?}", key);
        return;
    };
    // Checked under the entry lock: `clear` bumps the generation before it removes entries.
    if generation.load(Ordering::SeqCst) != started_in {
        tracing::debug!("Dropping result for {:?} fetched before the cache was cleared", key);
        return;
    }

    let current = entry.epoch == epoch;
    if current {
        entry.in_flight = None;
    }
    let still_fetching = entry.in_flight.is_some();

    entry.state.send_modify(|state| {
        match outcome {
            Ok(payload) => {
                state.status = QueryStatus::Success;
                state.data = Some(Arc::clone(payload));
                state.error = None;
                state.last_fetched_at = Some(Utc::now());
                state.is_stale = !current;
            }
            Err(e) => {
                state.status = QueryStatus::Error;
                state.error = Some(e.clone());
            }
        }
        state.is_fetching = still_fetching;
    });
}

async fn run_with_retry<K, T, F, Fut>(key: &K, retry: RetryPolicy, producer: &F) -> Result<T>
where
    K: Debug,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match producer().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retry.retries && e.is_retryable() => {
                attempt += 1;
                tracing::warn!("Fetch of {:?} failed ({}), retry {}/{}", key, e, attempt, retry.retries);
                if !retry.delay.is_zero() {
                    tokio::time::sleep(retry.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn downcast<K: Debug, T: Send + Sync + 'static>(key: &K, payload: Payload) -> Result<Arc<T>> {
    payload.downcast::<T>().map_err(|_| {
        ApiError::Internal(format!("cached value for {:?} has an unexpected type", key))
    })
}
