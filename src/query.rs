//! Typed observer over one cache key.
//!
//! Inspired by TanStack Query, a `Query<T>` binds a key and a fetcher to the
//! shared [`CacheStore`]. It registers itself as a subscriber so that
//! invalidations refetch it, and it reads its state back from the store, so
//! optimistic writes made by mutations show up on the next `poll()`.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let mut query = Query::new(&store, CourseKey::List.into(), move || {
//!     let api = api.clone();
//!     async move { api.list_courses().await }
//! });
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheStore, FetchStatus, Fetcher, QueryKey, Subscription};
use crate::envelope::EngineError;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is fetching and has no data yet
  Loading,
  /// Data is available (possibly being refreshed in the background)
  Success(T),
  /// Query failed and has no data to show
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Cache-backed query for data fetching with state management.
pub struct Query<T> {
  store: CacheStore,
  key: QueryKey,
  state: QueryState<T>,
  seen_revision: Option<u64>,
  pending: Option<JoinHandle<()>>,
  _subscription: Subscription,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create a new query and subscribe it to `key`.
  ///
  /// The fetcher is a closure that returns a future. It is called for
  /// `fetch()`, `refetch()` and whenever the key is invalidated while this
  /// query is alive.
  pub fn new<F, Fut>(store: &CacheStore, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
  {
    let fetcher: Fetcher = Arc::new(move || {
      let fut = fetcher();
      async move {
        let data = fut.await?;
        Ok::<_, EngineError>(serde_json::to_value(data)?)
      }
      .boxed()
    });
    let subscription = store.subscribe(&key, Some(fetcher));

    let mut query = Self {
      store: store.clone(),
      key,
      state: QueryState::Idle,
      seen_revision: None,
      pending: None,
      _subscription: subscription,
      _marker: PhantomData,
    };
    query.sync();
    query
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if any is available.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check if a network fetch for this key is in flight.
  pub fn is_fetching(&self) -> bool {
    self
      .store
      .read(&self.key)
      .map(|e| e.is_fetching())
      .unwrap_or(false)
  }

  /// Check if the data is stale (older than stale time or invalidated).
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self.store.read(&self.key).map(|e| e.is_stale()).unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching unless the data is fresh or a fetch is already running.
  pub fn fetch(&mut self) {
    if self.pending.as_ref().is_some_and(|h| !h.is_finished()) {
      return;
    }
    if let Some(entry) = self.store.read(&self.key) {
      if entry.is_fetching() || !entry.is_stale() {
        return;
      }
    }
    self.start_fetch(false);
  }

  /// Force a refetch, even if data is fresh.
  pub fn refetch(&mut self) {
    self.start_fetch(true);
  }

  /// Pick up changes made to the entry since the last poll.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let revision = self.store.revision(&self.key);
    if revision == self.seen_revision {
      return false;
    }
    self.sync();
    true
  }

  fn sync(&mut self) {
    self.seen_revision = self.store.revision(&self.key);
    let Some(entry) = self.store.read(&self.key) else {
      self.state = QueryState::Idle;
      return;
    };

    self.state = match (entry.data, entry.status) {
      (Some(data), _) => match serde_json::from_value(data) {
        Ok(value) => QueryState::Success(value),
        Err(e) => QueryState::Error(format!("Failed to decode cached data: {}", e)),
      },
      (None, FetchStatus::Fetching) => QueryState::Loading,
      (None, FetchStatus::Error) => {
        QueryState::Error(entry.error.unwrap_or_else(|| "Query failed".to_string()))
      }
      (None, _) => QueryState::Idle,
    };
  }

  fn start_fetch(&mut self, force: bool) {
    if self.state.data().is_none() {
      self.state = QueryState::Loading;
    }

    let store = self.store.clone();
    let key = self.key.clone();
    self.pending = Some(tokio::spawn(async move {
      let result = if force {
        store.refetch(&key).await
      } else {
        store.fetch(&key).await
      };
      if let Err(e) = result {
        debug!(%key, "query fetch failed: {}", e);
      }
    }));
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("seen_revision", &self.seen_revision)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheOptions, KeyFilter};
  use crate::query_key;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn store() -> CacheStore {
    CacheStore::new(CacheOptions {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::from_secs(300),
    })
  }

  #[tokio::test]
  async fn test_query_success() {
    let store = store();
    let mut query = Query::new(&store, query_key!["numbers"], || async {
      Ok::<_, EngineError>(vec![1, 2, 3])
    });

    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    // Wait for the result
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_query_error() {
    let store = store();
    let mut query: Query<i32> = Query::new(&store, query_key!["broken"], || async {
      Err(EngineError::network("Something went wrong"))
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_error());
    assert_eq!(query.error(), Some("Something went wrong"));
  }

  #[tokio::test]
  async fn test_query_stale() {
    let store = CacheStore::new(CacheOptions {
      stale_time: Duration::ZERO,
      gc_time: Duration::from_secs(300),
    });
    let mut query = Query::new(&store, query_key!["answer"], || async { Ok::<_, EngineError>(42) });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();

    // With zero stale time, should immediately be stale
    assert!(query.is_stale());
  }

  #[tokio::test]
  async fn test_fetch_while_loading_is_noop() {
    let store = store();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut query = Query::new(&store, query_key!["slow"], move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, EngineError>(42)
      }
    });

    query.fetch();
    assert!(query.is_loading());

    // Second fetch should be no-op
    query.fetch();
    assert!(query.is_loading());

    tokio::time::sleep(Duration::from_millis(150)).await;
    query.poll();
    assert_eq!(query.data(), Some(&42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fresh_data_is_not_refetched() {
    let store = store();
    store.write(&query_key!["answer"], json!(7));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut query = Query::new(&store, query_key!["answer"], move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Ok::<_, EngineError>(42) }
    });

    assert_eq!(query.data(), Some(&7));
    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    query.refetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(query.poll());
    assert_eq!(query.data(), Some(&42));
  }

  #[tokio::test]
  async fn test_poll_sees_optimistic_writes() {
    let store = store();
    let key = query_key!["courses"];
    let mut query = Query::new(&store, key.clone(), || async {
      Ok::<_, EngineError>(vec!["c1".to_string(), "c2".to_string()])
    });
    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();

    store.write(&key, json!(["c2"]));
    assert!(query.poll());
    assert_eq!(query.data(), Some(&vec!["c2".to_string()]));
    assert!(!query.poll());
  }

  #[tokio::test]
  async fn test_invalidation_refetches_live_query() {
    let store = store();
    let key = query_key!["courses", {"status": "draft"}];
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut query = Query::new(&store, key.clone(), move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move { Ok::<_, EngineError>(n) }
    });
    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();
    assert_eq!(query.data(), Some(&0));

    store.invalidate(&KeyFilter::root("courses")).settled().await;
    assert!(query.poll());
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test]
  async fn test_dropping_query_unsubscribes() {
    let store = store();
    let key = query_key!["answer"];
    let query = Query::new(&store, key.clone(), || async { Ok::<_, EngineError>(1) });
    assert_eq!(store.observer_count(&key), 1);
    drop(query);
    assert_eq!(store.observer_count(&key), 0);
  }
}
