//! Optimistic mutation and autosave synchronization engine.
//!
//! The pieces, leaf first:
//!
//! - [`envelope`]: the `{success, data, message}` result shape and [`EngineError`]
//! - [`retry`]: bounded exponential backoff with retryable/terminal classification
//! - [`cache`]: the shared, key-addressed [`CacheStore`]
//! - [`query`]: typed observers that fetch into the store
//! - [`mutation`]: optimistic write pipeline with rollback
//! - [`autosave`]: debounced saving with conflict detection
//! - [`notify`]: notification dispatch deduplicated per operation
//!
//! [`transport`] adapts an HTTP backend to the envelope protocol, and
//! [`courses`] is the course-admin domain the demo console is built on.

pub mod autosave;
pub mod cache;
pub mod config;
pub mod courses;
pub mod envelope;
pub mod logging;
pub mod mutation;
pub mod notify;
pub mod query;
pub mod retry;
pub mod transport;

pub use autosave::{AutoSave, AutoSaveOptions, AutoSaveTimings, ConflictResolution, SaveStatus};
pub use cache::{CacheStore, KeyFilter, QueryKey, Snapshot};
pub use envelope::{EngineError, Envelope, ErrorKind};
pub use mutation::{Mutation, MutationStatus, OptimisticScope};
pub use notify::{NotificationCenter, Notifier};
pub use query::{Query, QueryState};
pub use retry::{execute_with_retry, RetryController, RetryPolicy, TerminalError};
