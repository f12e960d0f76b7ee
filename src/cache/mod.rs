//! In-memory cache of query results with optimistic write support.
//!
//! This module provides:
//! - Structural query keys with prefix-based selection
//! - Snapshot/restore for rolling back optimistic writes
//! - Invalidation that refetches actively observed keys
//! - Cache-first fetching with offline fallback to stale data
//! - Garbage collection of unobserved entries

mod key;
mod store;
mod traits;

pub use key::{KeyFilter, QueryKey};
pub use store::{CacheStore, Fetcher, Invalidation, InvocationId, Snapshot, Subscription};
pub use traits::{CacheEntry, CacheOptions, CacheResult, CacheSource, FetchStatus};
