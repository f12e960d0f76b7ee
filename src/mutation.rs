//! Optimistic mutations against the shared cache.
//!
//! A [`Mutation`] runs one ordered pipeline per call:
//!
//! 1. `on_mutate` snapshots and optimistically rewrites affected keys
//! 2. the network call runs, optionally under a [`RetryController`]
//! 3. on success: commit, invalidate, `on_success`, success notification
//! 4. on failure: restore the snapshot, `on_error`, error notification
//! 5. always: `on_settled`
//!
//! Invalidations started here are never awaited by the caller.
//!
//! # Example
//!
//! ```ignore
//! let delete = Mutation::new("delete-course", &store, move |id: String| {
//!     let api = api.clone();
//!     async move { api.delete_course(&id).await }
//! })
//! .on_mutate(|scope, id| {
//!     let snapshot = scope.snapshot(&KeyFilter::root("admin-courses"));
//!     scope.update::<Vec<Course>, _>(&list_key, |list| {
//!         list.map(|l| l.into_iter().filter(|c| &c.id != id).collect())
//!     })?;
//!     Ok(snapshot)
//! })
//! .on_settled(|_, _, store| {
//!     store.invalidate(&KeyFilter::root("admin-courses"));
//! })
//! .notifier(notifications.clone());
//!
//! delete.mutate("c1".to_string()).await?;
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, InvocationId, KeyFilter, QueryKey, Snapshot};
use crate::envelope::{EngineError, Envelope};
use crate::notify::{self, Notifier};
use crate::retry::RetryController;

type MutationFn<V, T> =
  Arc<dyn Fn(V) -> BoxFuture<'static, Result<Envelope<T>, EngineError>> + Send + Sync>;
type OnMutate<V> =
  Arc<dyn Fn(&OptimisticScope<'_>, &V) -> Result<Snapshot, EngineError> + Send + Sync>;
type OnSuccess<V, T> = Arc<dyn Fn(&Envelope<T>, &V, &CacheStore) + Send + Sync>;
type OnError<V> = Arc<dyn Fn(&EngineError, &V, Option<&Snapshot>) + Send + Sync>;
type OnSettled<V, T> =
  Arc<dyn Fn(Result<&Envelope<T>, &EngineError>, &V, &CacheStore) + Send + Sync>;
type KeysFor<V> = Arc<dyn Fn(&V) -> Vec<KeyFilter> + Send + Sync>;
type CommitKey<V> = Arc<dyn Fn(&V) -> QueryKey + Send + Sync>;

/// Lifecycle of the most recent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}

/// Cache access for `on_mutate`, bound to one invocation.
///
/// Writes made through the scope are tagged with the invocation, and
/// snapshots taken through it only roll back keys that invocation still owns.
pub struct OptimisticScope<'a> {
  store: &'a CacheStore,
  owner: InvocationId,
}

impl<'a> OptimisticScope<'a> {
  pub fn store(&self) -> &CacheStore {
    self.store
  }

  pub fn invocation(&self) -> InvocationId {
    self.owner
  }

  pub fn snapshot(&self, filter: &KeyFilter) -> Snapshot {
    self.store.snapshot_owned(filter, Some(self.owner))
  }

  pub fn snapshot_key(&self, key: &QueryKey) -> Snapshot {
    self.store.snapshot_key_owned(key, Some(self.owner))
  }

  pub fn write(&self, key: &QueryKey, data: Value) {
    self.store.write_owned(key, data, Some(self.owner));
  }

  pub fn set<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), EngineError> {
    let value = serde_json::to_value(data)?;
    self.write(key, value);
    Ok(())
  }

  pub fn get<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    self.store.get_query_data(key)
  }

  /// Read-modify-write under the store lock. `None` from `f` leaves the entry alone.
  pub fn update<T, F>(&self, key: &QueryKey, f: F) -> Result<bool, EngineError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Option<T>,
  {
    self.store.update_owned(key, f, Some(self.owner))
  }
}

#[derive(Default)]
struct Tracker {
  latest: Option<InvocationId>,
  status: MutationStatus,
}

/// A named write operation with optimistic cache handling.
///
/// Cloning is cheap and clones share status tracking.
pub struct Mutation<V, T> {
  name: String,
  store: CacheStore,
  mutation_fn: MutationFn<V, T>,
  on_mutate: Option<OnMutate<V>>,
  on_success: Option<OnSuccess<V, T>>,
  on_error: Option<OnError<V>>,
  on_settled: Option<OnSettled<V, T>>,
  invalidate: Vec<KeyFilter>,
  invalidate_with: Option<KeysFor<V>>,
  commit_to: Option<CommitKey<V>>,
  retry: Option<RetryController>,
  notifier: Option<Arc<dyn Notifier>>,
  success_message: Option<String>,
  silent: bool,
  tracker: Arc<Mutex<Tracker>>,
}

impl<V, T> Clone for Mutation<V, T> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      store: self.store.clone(),
      mutation_fn: Arc::clone(&self.mutation_fn),
      on_mutate: self.on_mutate.clone(),
      on_success: self.on_success.clone(),
      on_error: self.on_error.clone(),
      on_settled: self.on_settled.clone(),
      invalidate: self.invalidate.clone(),
      invalidate_with: self.invalidate_with.clone(),
      commit_to: self.commit_to.clone(),
      retry: self.retry.clone(),
      notifier: self.notifier.clone(),
      success_message: self.success_message.clone(),
      silent: self.silent,
      tracker: Arc::clone(&self.tracker),
    }
  }
}

impl<V, T> std::fmt::Debug for Mutation<V, T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mutation")
      .field("name", &self.name)
      .field("status", &self.tracker.lock().status)
      .field("silent", &self.silent)
      .finish_non_exhaustive()
  }
}

impl<V, T> Mutation<V, T>
where
  V: Clone + Serialize + Send + Sync + 'static,
  T: Serialize + Send + Sync + 'static,
{
  /// Create a mutation. `name` is the operation name used for notification ids.
  pub fn new<F, Fut>(name: impl Into<String>, store: &CacheStore, mutation_fn: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Envelope<T>, EngineError>> + Send + 'static,
  {
    Self {
      name: name.into(),
      store: store.clone(),
      mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
      on_mutate: None,
      on_success: None,
      on_error: None,
      on_settled: None,
      invalidate: Vec::new(),
      invalidate_with: None,
      commit_to: None,
      retry: None,
      notifier: None,
      success_message: None,
      silent: false,
      tracker: Arc::new(Mutex::new(Tracker::default())),
    }
  }

  /// Runs before the network call. The returned snapshot is restored if the
  /// call fails. An error here fails the invocation without a network call.
  pub fn on_mutate(
    mut self,
    f: impl Fn(&OptimisticScope<'_>, &V) -> Result<Snapshot, EngineError> + Send + Sync + 'static,
  ) -> Self {
    self.on_mutate = Some(Arc::new(f));
    self
  }

  pub fn on_success(mut self, f: impl Fn(&Envelope<T>, &V, &CacheStore) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  /// Runs after the optimistic snapshot, if any, has been restored.
  pub fn on_error(
    mut self,
    f: impl Fn(&EngineError, &V, Option<&Snapshot>) + Send + Sync + 'static,
  ) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Result<&Envelope<T>, &EngineError>, &V, &CacheStore) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }

  /// Invalidate `filter` after every successful call.
  pub fn invalidate(mut self, filter: KeyFilter) -> Self {
    self.invalidate.push(filter);
    self
  }

  /// Invalidate filters computed from the variables after a successful call.
  pub fn invalidate_with(mut self, f: impl Fn(&V) -> Vec<KeyFilter> + Send + Sync + 'static) -> Self {
    self.invalidate_with = Some(Arc::new(f));
    self
  }

  /// Write the response data into the key computed from the variables.
  pub fn commit_to(mut self, f: impl Fn(&V) -> QueryKey + Send + Sync + 'static) -> Self {
    self.commit_to = Some(Arc::new(f));
    self
  }

  pub fn retry(mut self, controller: RetryController) -> Self {
    self.retry = Some(controller);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  pub fn success_message(mut self, message: impl Into<String>) -> Self {
    self.success_message = Some(message.into());
    self
  }

  /// Suppress notifications; callbacks still run.
  pub fn silent(mut self) -> Self {
    self.silent = true;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Status of the most recent invocation.
  pub fn status(&self) -> MutationStatus {
    self.tracker.lock().status
  }

  pub fn is_pending(&self) -> bool {
    self.status() == MutationStatus::Pending
  }

  fn set_status(&self, invocation: InvocationId, status: MutationStatus) {
    let mut tracker = self.tracker.lock();
    if status == MutationStatus::Pending {
      tracker.latest = Some(invocation);
    }
    if tracker.latest == Some(invocation) {
      tracker.status = status;
    }
  }

  /// Run the pipeline once with `variables`.
  ///
  /// The returned error is the same value `on_error` received.
  pub async fn mutate(&self, variables: V) -> Result<Envelope<T>, EngineError> {
    let invocation = self.store.next_invocation();
    let operation_id = notify::operation_id(
      &self.name,
      &serde_json::to_value(&variables).unwrap_or_default(),
    );
    self.set_status(invocation, MutationStatus::Pending);
    debug!(
      mutation = %self.name,
      operation_id = %operation_id,
      invocation = invocation.get(),
      "mutation started"
    );

    let context = match &self.on_mutate {
      Some(on_mutate) => {
        let scope = OptimisticScope {
          store: &self.store,
          owner: invocation,
        };
        match on_mutate(&scope, &variables) {
          Ok(snapshot) => Some(snapshot),
          Err(e) => {
            warn!(mutation = %self.name, "optimistic update failed: {}", e);
            return Err(self.fail(invocation, &operation_id, &variables, None, e));
          }
        }
      }
      None => None,
    };

    let call = || (self.mutation_fn)(variables.clone());
    let result = match &self.retry {
      Some(controller) => controller.execute(call).await.map_err(EngineError::from),
      None => call().await,
    };

    match result.and_then(Envelope::into_result) {
      Ok(envelope) => {
        self.succeed(invocation, &operation_id, &variables, &envelope);
        Ok(envelope)
      }
      Err(e) => Err(self.fail(invocation, &operation_id, &variables, context.as_ref(), e)),
    }
  }

  fn succeed(
    &self,
    invocation: InvocationId,
    operation_id: &str,
    variables: &V,
    envelope: &Envelope<T>,
  ) {
    if let (Some(commit_to), Some(data)) = (&self.commit_to, &envelope.data) {
      let key = commit_to(variables);
      match serde_json::to_value(data) {
        Ok(value) => self.store.write(&key, value),
        Err(e) => warn!(mutation = %self.name, %key, "could not commit response: {}", e),
      }
    }

    let mut filters = self.invalidate.clone();
    if let Some(invalidate_with) = &self.invalidate_with {
      filters.extend(invalidate_with(variables));
    }
    for filter in &filters {
      self.store.invalidate(filter);
    }

    if let Some(on_success) = &self.on_success {
      on_success(envelope, variables, &self.store);
    }

    if let Some(notifier) = self.active_notifier() {
      let message = self
        .success_message
        .as_deref()
        .or(envelope.message.as_deref())
        .unwrap_or("Done");
      notifier.success(message, operation_id);
    }

    self.set_status(invocation, MutationStatus::Success);
    info!(mutation = %self.name, operation_id, "mutation succeeded");

    if let Some(on_settled) = &self.on_settled {
      on_settled(Ok(envelope), variables, &self.store);
    }
  }

  fn fail(
    &self,
    invocation: InvocationId,
    operation_id: &str,
    variables: &V,
    context: Option<&Snapshot>,
    error: EngineError,
  ) -> EngineError {
    if let Some(snapshot) = context {
      let restored = self.store.restore(snapshot);
      debug!(mutation = %self.name, restored, "optimistic update rolled back");
    }

    if let Some(on_error) = &self.on_error {
      on_error(&error, variables, context);
    }

    if let Some(notifier) = self.active_notifier() {
      notifier.error(&error.user_message(), &notify::error_id(operation_id));
    }

    self.set_status(invocation, MutationStatus::Error);
    warn!(
      mutation = %self.name,
      operation_id,
      kind = %error.kind,
      "mutation failed: {}",
      error.message
    );

    if let Some(on_settled) = &self.on_settled {
      on_settled(Err(&error), variables, &self.store);
    }
    error
  }

  fn active_notifier(&self) -> Option<&Arc<dyn Notifier>> {
    if self.silent {
      None
    } else {
      self.notifier.as_ref()
    }
  }
}
