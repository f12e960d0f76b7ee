//! Core types for the cache store.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use super::key::QueryKey;

/// Fetch lifecycle of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  /// Created but never fetched or written
  Idle,
  /// A fetch is in flight
  Fetching,
  /// Holds data from a fetch or a write
  Success,
  /// The last fetch failed; `data` may still hold the previous value
  Error,
}

/// Timing defaults applied to new entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
  /// How long fetched data counts as fresh
  pub stale_time: Duration,
  /// How long an unobserved entry survives before eviction
  pub gc_time: Duration,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(30),
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

/// Point-in-time copy of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: QueryKey,
  /// Last known-good value
  pub data: Option<Value>,
  /// Monotonic time of the last successful fetch or write
  pub fetched_at: Option<Instant>,
  /// Wall-clock time of the same event, for display
  pub updated_at: Option<DateTime<Utc>>,
  pub status: FetchStatus,
  /// Marked stale explicitly; the next read refetches regardless of age
  pub invalidated: bool,
  /// Message of the last failed fetch
  pub error: Option<String>,
  pub stale_time: Duration,
  pub gc_time: Duration,
}

impl CacheEntry {
  pub(crate) fn new(key: QueryKey, options: CacheOptions) -> Self {
    Self {
      key,
      data: None,
      fetched_at: None,
      updated_at: None,
      status: FetchStatus::Idle,
      invalidated: false,
      error: None,
      stale_time: options.stale_time,
      gc_time: options.gc_time,
    }
  }

  /// Check if the entry needs a refetch before it can be served as fresh.
  pub fn is_stale(&self) -> bool {
    if self.invalidated || self.data.is_none() {
      return true;
    }
    match self.fetched_at {
      Some(at) => at.elapsed() > self.stale_time,
      None => true,
    }
  }

  pub fn is_fetching(&self) -> bool {
    self.status == FetchStatus::Fetching
  }
}

/// Result from a cache-aware fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale
  CacheStale,
  /// Network unavailable, serving cached data
  Offline,
}
