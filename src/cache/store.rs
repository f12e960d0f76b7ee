//! Process-wide store of query results.
//!
//! The store is constructed once at start-up and passed around by handle
//! (`CacheStore` is a cheap `Arc` clone). Every operation takes the store
//! lock for its whole duration and never across an `.await`, so a single
//! `write`, `restore` or `invalidate` is atomic with respect to every other
//! observer.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::key::{KeyFilter, QueryKey};
use super::traits::{CacheEntry, CacheOptions, CacheResult, FetchStatus};
use crate::envelope::{EngineError, ErrorKind};

/// Produces the current server value for one key.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

/// Identifies one mutation invocation that wrote optimistic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(u64);

impl InvocationId {
  pub fn get(self) -> u64 {
    self.0
  }
}

struct Slot {
  entry: CacheEntry,
  /// Bumped on every change so observers can poll cheaply
  revision: u64,
  observers: usize,
  unobserved_since: Option<Instant>,
  fetcher: Option<Fetcher>,
  /// Invocation whose optimistic projection is currently visible
  optimistic_owner: Option<InvocationId>,
}

impl Slot {
  fn new(key: QueryKey, options: CacheOptions) -> Self {
    Self {
      entry: CacheEntry::new(key, options),
      revision: 0,
      observers: 0,
      unobserved_since: Some(Instant::now()),
      fetcher: None,
      optimistic_owner: None,
    }
  }

  fn touch(&mut self) {
    self.revision += 1;
  }
}

struct StoreInner {
  slots: Mutex<HashMap<QueryKey, Slot>>,
  options: CacheOptions,
  next_invocation: AtomicU64,
}

/// Captured cache state, used to undo optimistic writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
  owner: Option<InvocationId>,
  entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq)]
struct SnapshotEntry {
  key: QueryKey,
  /// `None` when the key was absent at capture time
  entry: Option<CacheEntry>,
  owner: Option<InvocationId>,
}

impl Snapshot {
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Invocation that took this snapshot, if it came from an optimistic scope.
  pub fn owner(&self) -> Option<InvocationId> {
    self.owner
  }

  /// Captured `(key, data)` pairs.
  pub fn iter(&self) -> impl Iterator<Item = (&QueryKey, Option<&Value>)> {
    self
      .entries
      .iter()
      .map(|e| (&e.key, e.entry.as_ref().and_then(|entry| entry.data.as_ref())))
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.entries.iter().map(|e| e.key.clone()).collect()
  }

  /// Captured data for one key.
  pub fn data(&self, key: &QueryKey) -> Option<&Value> {
    self
      .entries
      .iter()
      .find(|e| &e.key == key)
      .and_then(|e| e.entry.as_ref())
      .and_then(|entry| entry.data.as_ref())
  }

  /// Fold another snapshot in; keys already captured keep their first capture.
  pub fn merge(mut self, other: Snapshot) -> Self {
    for entry in other.entries {
      if !self.entries.iter().any(|e| e.key == entry.key) {
        self.entries.push(entry);
      }
    }
    if self.owner.is_none() {
      self.owner = other.owner;
    }
    self
  }
}

/// Outcome of an invalidation: the keys marked stale and the refetches it
/// started. Callers may await the handles or drop them.
#[derive(Debug, Default)]
pub struct Invalidation {
  pub keys: Vec<QueryKey>,
  pub refetches: Vec<JoinHandle<()>>,
}

impl Invalidation {
  /// Wait for every refetch this invalidation started.
  pub async fn settled(self) {
    for handle in self.refetches {
      if let Err(e) = handle.await {
        warn!("background refetch task ended abnormally: {}", e);
      }
    }
  }
}

/// Active interest in one key. Dropping it unregisters the subscriber.
pub struct Subscription {
  store: Weak<StoreInner>,
  key: QueryKey,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(inner) = self.store.upgrade() else {
      return;
    };
    let mut slots = inner.slots.lock();
    if let Some(slot) = slots.get_mut(&self.key) {
      slot.observers = slot.observers.saturating_sub(1);
      if slot.observers == 0 {
        slot.unobserved_since = Some(Instant::now());
      }
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("key", &self.key).finish()
  }
}

/// Key-addressed in-memory store of query results.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(CacheOptions::default())
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("entries", &self.len())
      .field("options", &self.inner.options)
      .finish()
  }
}

impl CacheStore {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(StoreInner {
        slots: Mutex::new(HashMap::new()),
        options,
        next_invocation: AtomicU64::new(1),
      }),
    }
  }

  pub fn options(&self) -> CacheOptions {
    self.inner.options
  }

  pub fn len(&self) -> usize {
    self.inner.slots.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.inner.slots.lock().keys().cloned().collect()
  }

  /// Allocate an id for a new mutation invocation.
  pub fn next_invocation(&self) -> InvocationId {
    InvocationId(self.inner.next_invocation.fetch_add(1, Ordering::Relaxed))
  }

  /// Copy of the entry for `key`. Never creates an entry and never fetches.
  pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.inner.slots.lock().get(key).map(|s| s.entry.clone())
  }

  /// Change counter of the entry for `key`.
  pub fn revision(&self, key: &QueryKey) -> Option<u64> {
    self.inner.slots.lock().get(key).map(|s| s.revision)
  }

  pub fn observer_count(&self, key: &QueryKey) -> usize {
    self
      .inner
      .slots
      .lock()
      .get(key)
      .map(|s| s.observers)
      .unwrap_or(0)
  }

  /// Decoded data for `key`. Undecodable data is logged and treated as absent.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    let data = self.read(key)?.data?;
    match serde_json::from_value(data) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(%key, "cached data does not match requested type: {}", e);
        None
      }
    }
  }

  /// Replace the data for `key`, marking it fresh.
  pub fn write(&self, key: &QueryKey, data: Value) {
    self.write_owned(key, data, None);
  }

  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), EngineError> {
    let value = serde_json::to_value(data)?;
    self.write(key, value);
    Ok(())
  }

  /// Read-modify-write of typed data. Returning `None` from `f` leaves the
  /// entry untouched. `f` runs under the store lock and must not call back
  /// into the store.
  pub fn update_query_data<T, F>(&self, key: &QueryKey, f: F) -> Result<bool, EngineError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>,
  {
    self.update_owned(key, f, None)
  }

  pub(crate) fn update_owned<T, F>(
    &self,
    key: &QueryKey,
    f: F,
    owner: Option<InvocationId>,
  ) -> Result<bool, EngineError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>,
  {
    let mut slots = self.inner.slots.lock();
    let current = match slots.get(key).and_then(|s| s.entry.data.clone()) {
      Some(data) => Some(serde_json::from_value::<T>(data)?),
      None => None,
    };
    let Some(next) = f(current) else {
      return Ok(false);
    };
    let value = serde_json::to_value(next)?;
    let options = self.inner.options;
    let slot = slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), options));
    Self::apply_write(slot, value, owner);
    debug!(%key, owner = owner.map(InvocationId::get), "cache entry updated");
    Ok(true)
  }

  pub(crate) fn write_owned(&self, key: &QueryKey, data: Value, owner: Option<InvocationId>) {
    let options = self.inner.options;
    let mut slots = self.inner.slots.lock();
    let slot = slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), options));
    Self::apply_write(slot, data, owner);
    debug!(%key, owner = owner.map(InvocationId::get), "cache entry written");
  }

  fn apply_write(slot: &mut Slot, data: Value, owner: Option<InvocationId>) {
    slot.entry.data = Some(data);
    slot.entry.status = FetchStatus::Success;
    slot.entry.fetched_at = Some(Instant::now());
    slot.entry.updated_at = Some(Utc::now());
    slot.entry.invalidated = false;
    slot.entry.error = None;
    slot.optimistic_owner = owner;
    slot.touch();
  }

  /// Capture every existing entry matching `filter`.
  pub fn snapshot(&self, filter: &KeyFilter) -> Snapshot {
    self.snapshot_owned(filter, None)
  }

  /// Capture one key, including its absence.
  pub fn snapshot_key(&self, key: &QueryKey) -> Snapshot {
    self.snapshot_key_owned(key, None)
  }

  pub(crate) fn snapshot_owned(&self, filter: &KeyFilter, owner: Option<InvocationId>) -> Snapshot {
    let slots = self.inner.slots.lock();
    let entries = slots
      .iter()
      .filter(|(key, _)| filter.matches(key))
      .map(|(key, slot)| SnapshotEntry {
        key: key.clone(),
        entry: Some(slot.entry.clone()),
        owner: slot.optimistic_owner,
      })
      .collect();
    Snapshot { owner, entries }
  }

  pub(crate) fn snapshot_key_owned(&self, key: &QueryKey, owner: Option<InvocationId>) -> Snapshot {
    let slots = self.inner.slots.lock();
    let slot = slots.get(key);
    Snapshot {
      owner,
      entries: vec![SnapshotEntry {
        key: key.clone(),
        entry: slot.map(|s| s.entry.clone()),
        owner: slot.and_then(|s| s.optimistic_owner),
      }],
    }
  }

  /// Write back exactly the captured entries. Returns how many were restored.
  ///
  /// A snapshot taken inside an optimistic scope only restores keys whose
  /// visible projection still belongs to that invocation; keys superseded by
  /// a newer write are left alone.
  pub fn restore(&self, snapshot: &Snapshot) -> usize {
    let options = self.inner.options;
    let mut slots = self.inner.slots.lock();
    let mut restored = 0;

    for captured in &snapshot.entries {
      let key = &captured.key;
      if let Some(owner) = snapshot.owner {
        let current_owner = slots.get(key).and_then(|s| s.optimistic_owner);
        if current_owner != Some(owner) {
          trace!(%key, owner = owner.get(), "skipping restore of superseded entry");
          continue;
        }
      }

      match &captured.entry {
        Some(entry) => {
          let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), options));
          slot.entry = entry.clone();
          slot.optimistic_owner = captured.owner;
          slot.touch();
        }
        None => {
          let observed = match slots.get(key) {
            Some(slot) => slot.observers > 0,
            None => continue,
          };
          if observed {
            if let Some(slot) = slots.get_mut(key) {
              slot.entry = CacheEntry::new(key.clone(), options);
              slot.optimistic_owner = None;
              slot.touch();
            }
          } else {
            slots.remove(key);
          }
        }
      }
      restored += 1;
    }

    debug!(restored, owner = snapshot.owner.map(InvocationId::get), "cache snapshot restored");
    restored
  }

  /// Mark matching entries stale and refetch the ones somebody is watching.
  ///
  /// Entries are not evicted. Refetches run as background tasks; without a
  /// tokio runtime the entries are only marked and refetch on next use.
  pub fn invalidate(&self, filter: &KeyFilter) -> Invalidation {
    let mut keys = Vec::new();
    let mut to_refetch = Vec::new();
    {
      let mut slots = self.inner.slots.lock();
      for (key, slot) in slots.iter_mut().filter(|(key, _)| filter.matches(key)) {
        slot.entry.invalidated = true;
        slot.touch();
        keys.push(key.clone());
        if slot.observers > 0 {
          if let Some(fetcher) = &slot.fetcher {
            to_refetch.push((key.clone(), Arc::clone(fetcher)));
          }
        }
      }
    }

    debug!(?filter, invalidated = keys.len(), refetching = to_refetch.len(), "cache invalidated");

    let mut refetches = Vec::new();
    if !to_refetch.is_empty() {
      match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
          for (key, fetcher) in to_refetch {
            let store = self.clone();
            refetches.push(handle.spawn(async move {
              if let Err(e) = store.run_fetch(&key, true, || fetcher()).await {
                debug!(%key, "background refetch failed: {}", e);
              }
            }));
          }
        }
        Err(_) => debug!("no runtime available, refetch deferred to next read"),
      }
    }

    Invalidation { keys, refetches }
  }

  /// Drop matching entries that nobody observes. Observed entries are reset
  /// to idle instead.
  pub fn remove(&self, filter: &KeyFilter) -> usize {
    let options = self.inner.options;
    let mut slots = self.inner.slots.lock();
    let matched: Vec<QueryKey> = slots.keys().filter(|k| filter.matches(k)).cloned().collect();
    for key in &matched {
      let observed = slots.get(key).map(|s| s.observers > 0).unwrap_or(false);
      if observed {
        if let Some(slot) = slots.get_mut(key) {
          slot.entry = CacheEntry::new(key.clone(), options);
          slot.optimistic_owner = None;
          slot.touch();
        }
      } else {
        slots.remove(key);
      }
    }
    matched.len()
  }

  /// Register an active subscriber for `key`. The fetcher, when given, is
  /// used for refetches triggered by invalidation.
  pub fn subscribe(&self, key: &QueryKey, fetcher: Option<Fetcher>) -> Subscription {
    let options = self.inner.options;
    let mut slots = self.inner.slots.lock();
    let slot = slots
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone(), options));
    slot.observers += 1;
    slot.unobserved_since = None;
    if fetcher.is_some() {
      slot.fetcher = fetcher;
    }
    Subscription {
      store: Arc::downgrade(&self.inner),
      key: key.clone(),
    }
  }

  /// Cache-first fetch of typed data.
  ///
  /// 1. Fresh cached data is returned immediately
  /// 2. Stale or missing data is fetched from the network
  /// 3. On network failure, stale data is served in offline mode
  /// 4. Without cached data the network error is returned
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
  ) -> Result<CacheResult<T>, EngineError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
  {
    let result = self
      .run_fetch(key, false, move || async move {
        let data = fetcher().await?;
        Ok::<_, EngineError>(serde_json::to_value(data)?)
      })
      .await?;
    let data = serde_json::from_value(result.data)?;
    Ok(CacheResult {
      data,
      source: result.source,
      cached_at: result.cached_at,
    })
  }

  /// Cache-first fetch using the fetcher registered by a subscriber.
  pub async fn fetch(&self, key: &QueryKey) -> Result<CacheResult<Value>, EngineError> {
    let fetcher = self.registered_fetcher(key)?;
    self.run_fetch(key, false, || fetcher()).await
  }

  /// Fetch regardless of freshness using the registered fetcher.
  pub async fn refetch(&self, key: &QueryKey) -> Result<CacheResult<Value>, EngineError> {
    let fetcher = self.registered_fetcher(key)?;
    self.run_fetch(key, true, || fetcher()).await
  }

  fn registered_fetcher(&self, key: &QueryKey) -> Result<Fetcher, EngineError> {
    self
      .inner
      .slots
      .lock()
      .get(key)
      .and_then(|s| s.fetcher.clone())
      .ok_or_else(|| {
        EngineError::new(
          ErrorKind::NotFound,
          format!("No fetcher registered for {}", key),
        )
      })
  }

  async fn run_fetch<F, Fut>(
    &self,
    key: &QueryKey,
    force: bool,
    fetcher: F,
  ) -> Result<CacheResult<Value>, EngineError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, EngineError>>,
  {
    let previous: Option<(Value, Option<DateTime<Utc>>)> = {
      let options = self.inner.options;
      let mut slots = self.inner.slots.lock();
      let slot = slots
        .entry(key.clone())
        .or_insert_with(|| Slot::new(key.clone(), options));
      let entry = &slot.entry;

      if !force {
        if let Some(data) = &entry.data {
          if !entry.is_stale() {
            return Ok(CacheResult::from_cache(data.clone(), entry.updated_at, false));
          }
          if entry.is_fetching() {
            // Someone else is already refreshing this key
            return Ok(CacheResult::from_cache(data.clone(), entry.updated_at, true));
          }
        }
      }

      let previous = entry.data.clone().map(|d| (d, entry.updated_at));
      slot.entry.status = FetchStatus::Fetching;
      slot.touch();
      previous
    };

    trace!(%key, force, "fetching");
    match fetcher().await {
      Ok(data) => {
        self.write_owned(key, data.clone(), None);
        Ok(CacheResult::from_network(data))
      }
      Err(e) => {
        {
          let mut slots = self.inner.slots.lock();
          if let Some(slot) = slots.get_mut(key) {
            slot.entry.status = FetchStatus::Error;
            slot.entry.error = Some(e.message.clone());
            slot.touch();
          }
        }
        match previous {
          Some((data, cached_at)) => {
            warn!(%key, "fetch failed, serving cached data: {}", e);
            Ok(CacheResult::offline(data, cached_at))
          }
          None => Err(e),
        }
      }
    }
  }

  /// Evict unobserved entries whose gc time has elapsed.
  pub fn collect_garbage(&self) -> usize {
    let mut slots = self.inner.slots.lock();
    let before = slots.len();
    slots.retain(|_, slot| {
      if slot.observers > 0 {
        return true;
      }
      match slot.unobserved_since {
        Some(since) => since.elapsed() < slot.entry.gc_time,
        None => true,
      }
    });
    let evicted = before - slots.len();
    if evicted > 0 {
      debug!(evicted, "cache garbage collected");
    }
    evicted
  }

  /// Run [`collect_garbage`](Self::collect_garbage) every `interval` until
  /// the store is dropped.
  pub fn spawn_gc(&self, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        CacheStore { inner }.collect_garbage();
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheSource;
  use crate::query_key;
  use futures::FutureExt;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;

  fn store() -> CacheStore {
    CacheStore::new(CacheOptions {
      stale_time: Duration::from_secs(10),
      gc_time: Duration::from_secs(60),
    })
  }

  fn counting_fetcher(calls: Arc<AtomicU32>, value: Value) -> Fetcher {
    Arc::new(move || {
      let calls = Arc::clone(&calls);
      let value = value.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, EngineError>(value)
      }
      .boxed()
    })
  }

  #[test]
  fn test_read_never_creates_entries() {
    let store = store();
    assert!(store.read(&query_key!["courses"]).is_none());
    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn test_write_marks_success_and_fresh() {
    let store = store();
    let key = query_key!["courses"];
    store.write(&key, json!(["c1"]));

    let entry = store.read(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert_eq!(entry.data, Some(json!(["c1"])));
    assert!(entry.fetched_at.is_some());
    assert!(!entry.is_stale());
  }

  #[tokio::test]
  async fn test_snapshot_and_restore_round_trip_exactly() {
    let store = store();
    let list = query_key!["admin-courses", {"status": "all"}];
    let other = query_key!["users"];
    store.write(&list, json!(["c1", "c2", "c3"]));
    store.write(&other, json!({"id": "u1"}));

    let before = store.read(&list).unwrap();
    let snapshot = store.snapshot(&KeyFilter::root("admin-courses"));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.data(&list), Some(&json!(["c1", "c2", "c3"])));

    store.write(&list, json!(["c2", "c3"]));
    assert_eq!(store.restore(&snapshot), 1);
    assert_eq!(store.read(&list).unwrap(), before);
  }

  #[tokio::test]
  async fn test_restore_of_absent_key_removes_it() {
    let store = store();
    let key = query_key!["course", "new"];
    let snapshot = store.snapshot_key(&key);
    store.write(&key, json!({"title": "Draft"}));

    store.restore(&snapshot);
    assert!(store.read(&key).is_none());
  }

  #[tokio::test]
  async fn test_owned_restore_skips_superseded_entries() {
    let store = store();
    let key = query_key!["courses"];
    store.write(&key, json!(["c1", "c2"]));

    let first = store.next_invocation();
    let second = store.next_invocation();
    let snap = store.snapshot_owned(&KeyFilter::from(key.clone()), Some(first));
    store.write_owned(&key, json!(["c2"]), Some(first));
    store.write_owned(&key, json!([]), Some(second));

    assert_eq!(store.restore(&snap), 0);
    assert_eq!(store.get_query_data::<Vec<String>>(&key), Some(vec![]));
  }

  #[tokio::test]
  async fn test_invalidate_marks_stale_without_evicting() {
    let store = store();
    store.write(&query_key!["courses", "c1"], json!({"id": "c1"}));
    store.write(&query_key!["courses", "c2"], json!({"id": "c2"}));
    store.write(&query_key!["users"], json!([]));

    let report = store.invalidate(&KeyFilter::root("courses"));
    assert_eq!(report.keys.len(), 2);
    assert!(report.refetches.is_empty());

    let entry = store.read(&query_key!["courses", "c1"]).unwrap();
    assert!(entry.invalidated);
    assert!(entry.is_stale());
    assert_eq!(entry.data, Some(json!({"id": "c1"})));
    assert!(!store.read(&query_key!["users"]).unwrap().invalidated);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_observed_entries() {
    let store = store();
    let key = query_key!["courses"];
    let calls = Arc::new(AtomicU32::new(0));
    let _sub = store.subscribe(&key, Some(counting_fetcher(calls.clone(), json!(["fresh"]))));
    store.write(&key, json!(["old"]));

    let report = store.invalidate(&KeyFilter::from(key.clone()));
    assert_eq!(report.refetches.len(), 1);
    report.settled().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let entry = store.read(&key).unwrap();
    assert_eq!(entry.data, Some(json!(["fresh"])));
    assert!(!entry.invalidated);
  }

  #[tokio::test]
  async fn test_settled_outlives_a_panicking_refetch() {
    let store = store();
    let key = query_key!["courses"];
    let fetcher: Fetcher = Arc::new(|| {
      futures::future::lazy(|_| -> Result<Value, EngineError> { panic!("refetch exploded") }).boxed()
    });
    let _sub = store.subscribe(&key, Some(fetcher));
    store.write(&key, json!(["old"]));

    let report = store.invalidate(&KeyFilter::from(key.clone()));
    assert_eq!(report.refetches.len(), 1);
    report.settled().await;

    assert_eq!(store.read(&key).unwrap().data, Some(json!(["old"])));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_query_serves_fresh_cache() {
    let store = store();
    let key = query_key!["courses"];
    let calls = AtomicU32::new(0);

    let first = store
      .fetch_query(&key, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["c1".to_string()])
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second: CacheResult<Vec<String>> = store
      .fetch_query(&key, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["c2".to_string()])
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, vec!["c1".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    let third: CacheResult<Vec<String>> = store
      .fetch_query(&key, || async { Ok(vec!["c3".to_string()]) })
      .await
      .unwrap();
    assert_eq!(third.source, CacheSource::Network);
    assert_eq!(third.data, vec!["c3".to_string()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_query_offline_fallback() {
    let store = store();
    let key = query_key!["courses"];
    store.write(&key, json!(["cached"]));
    tokio::time::advance(Duration::from_secs(11)).await;

    let result: CacheResult<Vec<String>> = store
      .fetch_query(&key, || async { Err(EngineError::network("offline")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, vec!["cached".to_string()]);

    let entry = store.read(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Error);
    assert_eq!(entry.error.as_deref(), Some("offline"));
  }

  #[tokio::test]
  async fn test_fetch_query_without_cache_propagates_error() {
    let store = store();
    let result: Result<CacheResult<Vec<String>>, _> = store
      .fetch_query(&query_key!["courses"], || async {
        Err(EngineError::network("offline"))
      })
      .await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gc_evicts_unobserved_entries_after_gc_time() {
    let store = store();
    let watched = query_key!["watched"];
    let idle = query_key!["idle"];
    let sub = store.subscribe(&watched, None);
    store.write(&watched, json!(1));
    store.write(&idle, json!(2));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(store.collect_garbage(), 1);
    assert!(store.read(&idle).is_none());
    assert!(store.read(&watched).is_some());

    drop(sub);
    assert_eq!(store.observer_count(&watched), 0);
    assert_eq!(store.collect_garbage(), 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(store.collect_garbage(), 1);
  }

  #[tokio::test]
  async fn test_update_query_data_is_typed() {
    let store = store();
    let key = query_key!["courses"];
    store
      .set_query_data(&key, &vec!["c1".to_string(), "c2".to_string()])
      .unwrap();

    let changed = store
      .update_query_data::<Vec<String>, _>(&key, |list| {
        list.map(|l| l.into_iter().filter(|c| c != "c1").collect())
      })
      .unwrap();
    assert!(changed);
    assert_eq!(
      store.get_query_data::<Vec<String>>(&key),
      Some(vec!["c2".to_string()])
    );
  }
}
