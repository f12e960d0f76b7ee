//! Debounced autosave with conflict detection.
//!
//! [`AutoSave`] tracks the latest caller state against the last state the
//! server accepted. Each qualifying change restarts one debounce timer, and
//! only the timer's final firing saves. The timer is cancelled by newer
//! changes and by [`AutoSave::force_save`], but a save that already started
//! always runs to completion.
//!
//! ```text
//! Idle --change--> (timer) --fires, data differs--> Saving
//! Saving --ok--> Saved --display window--> Idle
//! Saving --conflict--> Conflict   (held until resolve_conflict)
//! Saving --other error--> Error   (next change or force_save retries)
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::envelope::{EngineError, Envelope, ErrorKind};
use crate::notify::{self, Notifier};
use crate::retry::{CodeTable, RetryClassifier, RetryController, RetryPolicy, TimeoutOnly};

const CONFLICT_MESSAGE: &str =
  "This draft was changed somewhere else. Keep your version or load the latest one.";

type SaveFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<Option<String>, EngineError>> + Send + Sync>;
type Comparator<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type Transform<T> = Arc<dyn Fn(T) -> T + Send + Sync>;
type ConflictHook = Arc<dyn Fn(&EngineError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveStatus {
  #[default]
  Idle,
  Saving,
  Saved,
  Error,
  /// Held until [`AutoSave::resolve_conflict`] is called
  Conflict,
}

impl SaveStatus {
  pub fn label(self) -> &'static str {
    match self {
      SaveStatus::Idle => "idle",
      SaveStatus::Saving => "saving",
      SaveStatus::Saved => "saved",
      SaveStatus::Error => "error",
      SaveStatus::Conflict => "conflict",
    }
  }
}

/// How to leave the conflict state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution<T> {
  /// Adopt the server copy. `None` uses the copy carried by the conflict error.
  AcceptRemote(Option<T>),
  /// Overwrite the server copy with the local state.
  KeepLocal,
}

/// Timing knobs for one autosave session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSaveTimings {
  /// Quiet period after the last change before saving
  pub delay: Duration,
  /// How long `Saved` is shown before returning to `Idle`
  pub saved_display: Duration,
  /// Extra attempts `force_save` makes after a timeout
  pub timeout_retries: u32,
  pub timeout_retry_delay: Duration,
}

impl Default for AutoSaveTimings {
  fn default() -> Self {
    Self {
      delay: Duration::from_millis(2000),
      saved_display: Duration::from_millis(2000),
      timeout_retries: 2,
      timeout_retry_delay: Duration::from_millis(1000),
    }
  }
}

/// Construction options for [`AutoSave`].
pub struct AutoSaveOptions<T> {
  on_save: SaveFn<T>,
  timings: AutoSaveTimings,
  enabled: bool,
  on_conflict: Option<ConflictHook>,
  has_data_changed: Option<Comparator<T>>,
  transform: Option<Transform<T>>,
  notifier: Option<Arc<dyn Notifier>>,
  operation_id: String,
}

impl<T: Send + 'static> AutoSaveOptions<T> {
  /// `on_save` receives the (transformed) data and resolves to the server's
  /// envelope. A `success: false` envelope counts as a failed save.
  pub fn new<F, Fut, R>(on_save: F) -> Self
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Envelope<R>, EngineError>> + Send + 'static,
    R: Send + 'static,
  {
    let on_save: SaveFn<T> = Arc::new(move |data| {
      let fut = on_save(data);
      async move { fut.await.and_then(Envelope::into_result).map(|e| e.message) }.boxed()
    });
    Self {
      on_save,
      timings: AutoSaveTimings::default(),
      enabled: true,
      on_conflict: None,
      has_data_changed: None,
      transform: None,
      notifier: None,
      operation_id: "autosave".to_string(),
    }
  }

  pub fn delay(mut self, delay: Duration) -> Self {
    self.timings.delay = delay;
    self
  }

  pub fn saved_display(mut self, window: Duration) -> Self {
    self.timings.saved_display = window;
    self
  }

  pub fn timings(mut self, timings: AutoSaveTimings) -> Self {
    self.timings = timings;
    self
  }

  /// Attempts and spacing for timeouts during `force_save`.
  pub fn timeout_retry(mut self, retries: u32, delay: Duration) -> Self {
    self.timings.timeout_retries = retries;
    self.timings.timeout_retry_delay = delay;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn on_conflict(mut self, f: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
    self.on_conflict = Some(Arc::new(f));
    self
  }

  /// Replace structural equality. Called as `f(current, last_saved)`.
  pub fn has_data_changed(mut self, f: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
    self.has_data_changed = Some(Arc::new(f));
    self
  }

  /// Shape the data before it is handed to `on_save`.
  pub fn transform(mut self, f: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
    self.transform = Some(Arc::new(f));
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn Notifier>, operation_id: impl Into<String>) -> Self {
    self.notifier = Some(notifier);
    self.operation_id = operation_id.into();
    self
  }
}

struct Session<T> {
  current: T,
  last_saved: T,
  status: SaveStatus,
  enabled: bool,
  timer: Option<JoinHandle<()>>,
  timer_generation: u64,
  /// Bumped on every status change; stale display-window resets check it
  status_generation: u64,
  conflict_data: Option<Value>,
  last_error: Option<EngineError>,
}

impl<T> Session<T> {
  fn cancel_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.abort();
    }
    self.timer_generation += 1;
  }
}

struct Inner<T> {
  options: AutoSaveOptions<T>,
  session: Mutex<Session<T>>,
  /// Held for the whole duration of a save
  save_lock: tokio::sync::Mutex<()>,
  status_tx: watch::Sender<SaveStatus>,
}

impl<T> Drop for Inner<T> {
  fn drop(&mut self) {
    if let Some(timer) = self.session.get_mut().timer.take() {
      timer.abort();
    }
  }
}

/// Autosave session for one document.
///
/// Clones share the session. The pending timer is cancelled when the last
/// clone is dropped.
pub struct AutoSave<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for AutoSave<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> AutoSave<T>
where
  T: Clone + PartialEq + DeserializeOwned + Send + Sync + 'static,
{
  /// Start a session. `initial` counts as already saved, so mounting an
  /// editor never triggers a save.
  pub fn new(initial: T, options: AutoSaveOptions<T>) -> Self {
    let (status_tx, _) = watch::channel(SaveStatus::Idle);
    let enabled = options.enabled;
    Self {
      inner: Arc::new(Inner {
        options,
        session: Mutex::new(Session {
          current: initial.clone(),
          last_saved: initial,
          status: SaveStatus::Idle,
          enabled,
          timer: None,
          timer_generation: 0,
          status_generation: 0,
          conflict_data: None,
          last_error: None,
        }),
        save_lock: tokio::sync::Mutex::new(()),
        status_tx,
      }),
    }
  }

  /// Feed the latest caller state.
  pub fn update(&self, data: T) {
    let mut session = self.inner.session.lock();
    session.current = data;
    if !session.enabled {
      return;
    }
    if session.status == SaveStatus::Conflict {
      trace!(operation_id = %self.inner.options.operation_id, "change ignored while in conflict");
      return;
    }
    if self.inner.changed(&session.current, &session.last_saved) {
      self.inner.arm(&mut session);
    }
  }

  pub fn set_enabled(&self, enabled: bool) {
    let mut session = self.inner.session.lock();
    session.enabled = enabled;
    if !enabled {
      session.cancel_timer();
    } else if session.status != SaveStatus::Conflict
      && self.inner.changed(&session.current, &session.last_saved)
    {
      self.inner.arm(&mut session);
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.inner.session.lock().enabled
  }

  /// Cancel any pending timer and save right away.
  ///
  /// Timeouts are retried with a fixed delay; conflicts and every other
  /// failure are returned after one attempt.
  pub async fn force_save(&self) -> Result<(), EngineError> {
    self.inner.session.lock().cancel_timer();
    self.inner.save(true).await.map(|_| ())
  }

  /// Leave the conflict state.
  pub async fn resolve_conflict(&self, resolution: ConflictResolution<T>) -> Result<(), EngineError> {
    match resolution {
      ConflictResolution::KeepLocal => {
        info!(operation_id = %self.inner.options.operation_id, "conflict resolved by keeping local changes");
        self.force_save().await
      }
      ConflictResolution::AcceptRemote(remote) => {
        {
          let mut session = self.inner.session.lock();
          if session.status != SaveStatus::Conflict {
            return Err(EngineError::new(
              ErrorKind::Validation,
              "There is no conflict to resolve",
            ));
          }
          let remote = match (remote, session.conflict_data.clone()) {
            (Some(remote), _) => remote,
            (None, Some(data)) => serde_json::from_value(data)?,
            (None, None) => {
              return Err(EngineError::new(
                ErrorKind::Conflict,
                "The server did not send its copy of the document",
              ))
            }
          };
          session.cancel_timer();
          session.current = remote.clone();
          session.last_saved = remote;
          session.conflict_data = None;
          session.last_error = None;
          self.inner.set_status(&mut session, SaveStatus::Saved);
          self.inner.schedule_idle(&session);
        }
        info!(operation_id = %self.inner.options.operation_id, "conflict resolved by accepting remote copy");
        if let Some(notifier) = &self.inner.options.notifier {
          notifier.dismiss(&self.inner.options.operation_id);
        }
        Ok(())
      }
    }
  }

  pub fn status(&self) -> SaveStatus {
    self.inner.session.lock().status
  }

  /// Receiver that observes every status change.
  pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
    self.inner.status_tx.subscribe()
  }

  /// True when the current data differs from the last saved data and no
  /// save is in flight.
  pub fn has_unsaved_changes(&self) -> bool {
    let session = self.inner.session.lock();
    session.status != SaveStatus::Saving
      && self.inner.changed(&session.current, &session.last_saved)
  }

  pub fn current(&self) -> T {
    self.inner.session.lock().current.clone()
  }

  pub fn last_saved(&self) -> T {
    self.inner.session.lock().last_saved.clone()
  }

  /// Server copy carried by the last conflict, if any.
  pub fn conflict_data(&self) -> Option<Value> {
    self.inner.session.lock().conflict_data.clone()
  }

  pub fn last_error(&self) -> Option<EngineError> {
    self.inner.session.lock().last_error.clone()
  }

  pub fn operation_id(&self) -> &str {
    &self.inner.options.operation_id
  }
}

impl<T> Inner<T>
where
  T: Clone + PartialEq + Send + Sync + 'static,
{
  fn changed(&self, current: &T, last_saved: &T) -> bool {
    match &self.options.has_data_changed {
      Some(f) => f(current, last_saved),
      None => current != last_saved,
    }
  }

  fn set_status(&self, session: &mut Session<T>, status: SaveStatus) {
    session.status = status;
    session.status_generation += 1;
    self.status_tx.send_replace(status);
  }

  /// Restart the debounce timer. Without a tokio runtime the change stays
  /// pending until the next `force_save` or the next change made inside one.
  fn arm(self: &Arc<Self>, session: &mut Session<T>) {
    session.cancel_timer();
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      debug!(operation_id = %self.options.operation_id, "no runtime available, autosave deferred");
      return;
    };
    let generation = session.timer_generation;
    let delay = self.options.timings.delay;
    let weak = Arc::downgrade(self);
    trace!(delay_ms = delay.as_millis() as u64, "autosave timer armed");

    session.timer = Some(handle.spawn(async move {
      tokio::time::sleep(delay).await;
      let Some(inner) = weak.upgrade() else {
        return;
      };
      {
        let mut session = inner.session.lock();
        if session.timer_generation != generation {
          return;
        }
        session.timer = None;
      }
      // Separate task so a later abort of this timer cannot cancel the save
      tokio::spawn(async move {
        if let Err(e) = inner.save(false).await {
          debug!("debounced save failed: {}", e);
        }
      });
    }));
  }

  /// Return to `Idle` once the saved display window passes, unless the
  /// status changed in the meantime.
  fn schedule_idle(self: &Arc<Self>, session: &Session<T>) {
    let generation = session.status_generation;
    let window = self.options.timings.saved_display;
    let weak = Arc::downgrade(self);
    tokio::spawn(async move {
      tokio::time::sleep(window).await;
      let Some(inner) = weak.upgrade() else {
        return;
      };
      let mut session = inner.session.lock();
      if session.status_generation == generation && session.status == SaveStatus::Saved {
        inner.set_status(&mut session, SaveStatus::Idle);
      }
    });
  }

  /// Run one save. Returns `Ok(false)` when a debounced save found nothing
  /// to do.
  async fn save(self: &Arc<Self>, forced: bool) -> Result<bool, EngineError> {
    let _guard = self.save_lock.lock().await;

    let data = {
      let mut session = self.session.lock();
      if !forced {
        if !session.enabled || session.status == SaveStatus::Conflict {
          return Ok(false);
        }
        if !self.changed(&session.current, &session.last_saved) {
          trace!(operation_id = %self.options.operation_id, "no changes since last save, skipping");
          return Ok(false);
        }
      }
      self.set_status(&mut session, SaveStatus::Saving);
      session.current.clone()
    };

    let payload = match &self.options.transform {
      Some(transform) => transform(data.clone()),
      None => data.clone(),
    };
    debug!(operation_id = %self.options.operation_id, forced, "saving");

    let result = if forced {
      let timings = self.options.timings;
      RetryController::new(RetryPolicy::fixed(
        timings.timeout_retries,
        timings.timeout_retry_delay,
      ))
      .with_classifier(TimeoutOnly)
      .execute(|| (self.options.on_save)(payload.clone()))
      .await
      .map_err(EngineError::from)
    } else {
      (self.options.on_save)(payload).await
    };

    match result {
      Ok(message) => {
        self.saved(data, message, forced);
        Ok(true)
      }
      Err(e) => {
        self.failed(&e);
        Err(e)
      }
    }
  }

  fn saved(self: &Arc<Self>, data: T, message: Option<String>, forced: bool) {
    {
      let mut session = self.session.lock();
      session.last_saved = data;
      session.conflict_data = None;
      session.last_error = None;
      self.set_status(&mut session, SaveStatus::Saved);
      self.schedule_idle(&session);

      // Changes made while the request was in flight
      if session.timer.is_none()
        && session.enabled
        && self.changed(&session.current, &session.last_saved)
      {
        self.arm(&mut session);
      }
    }

    info!(operation_id = %self.options.operation_id, "saved");
    if let Some(notifier) = &self.options.notifier {
      if forced {
        notifier.success(message.as_deref().unwrap_or("Saved"), &self.options.operation_id);
      } else {
        // Clears an earlier failure message for this document
        notifier.dismiss(&self.options.operation_id);
      }
    }
  }

  fn failed(&self, error: &EngineError) {
    let operation_id = &self.options.operation_id;
    {
      let mut session = self.session.lock();
      session.last_error = Some(error.clone());
      if error.is_conflict() {
        session.cancel_timer();
        session.conflict_data = error.conflict_data.clone();
        self.set_status(&mut session, SaveStatus::Conflict);
      } else {
        self.set_status(&mut session, SaveStatus::Error);
      }
    }

    if error.is_conflict() {
      info!(operation_id = %operation_id, "save rejected with a conflict");
      if let Some(on_conflict) = &self.options.on_conflict {
        on_conflict(error);
      }
      if let Some(notifier) = &self.options.notifier {
        notifier.persistent(CONFLICT_MESSAGE, operation_id);
      }
      return;
    }

    warn!(operation_id = %operation_id, kind = %error.kind, "save failed: {}", error.message);
    if let Some(notifier) = &self.options.notifier {
      let message = match &error.suggested_action {
        Some(_) => error.user_message(),
        None => error
          .clone()
          .with_suggested_action(CodeTable::default().suggested_action(error))
          .user_message(),
      };
      notifier.error(&message, &notify::error_id(operation_id));
    }
  }
}

impl<T> std::fmt::Debug for AutoSave<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let session = self.inner.session.lock();
    f.debug_struct("AutoSave")
      .field("operation_id", &self.inner.options.operation_id)
      .field("status", &session.status)
      .field("enabled", &session.enabled)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::{Level, NotificationCenter};
  use serde::{Deserialize, Serialize};
  use serde_json::json;
  use tokio::time::{sleep, Instant};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Draft {
    title: String,
    #[serde(default)]
    cursor: u32,
  }

  fn draft(title: &str) -> Draft {
    Draft {
      title: title.to_string(),
      cursor: 0,
    }
  }

  type Calls = Arc<Mutex<Vec<(Draft, Instant)>>>;

  /// Options whose `on_save` records each call and answers with `outcome(n)`.
  fn recording(
    calls: &Calls,
    outcome: impl Fn(usize) -> Result<(), EngineError> + Send + Sync + 'static,
  ) -> AutoSaveOptions<Draft> {
    let calls = Arc::clone(calls);
    AutoSaveOptions::new(move |data: Draft| {
      let n = {
        let mut calls = calls.lock();
        calls.push((data, Instant::now()));
        calls.len() - 1
      };
      let result = outcome(n).map(|_| Envelope::<()>::ok_empty());
      async move { result }
    })
    .delay(Duration::from_millis(1000))
  }

  fn always_ok(calls: &Calls) -> AutoSaveOptions<Draft> {
    recording(calls, |_| Ok(()))
  }

  fn conflict() -> EngineError {
    EngineError::from_response(Some(409), None, "Version mismatch")
      .with_conflict_data(json!({"title": "Remote Title"}))
  }

  #[tokio::test(start_paused = true)]
  async fn test_rapid_changes_save_once_with_final_value() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft(""), always_ok(&calls));

    for (i, title) in ["R", "Ru", "Rus", "Rust", "Rust!"].iter().enumerate() {
      if i > 0 {
        sleep(Duration::from_millis(100)).await;
      }
      autosave.update(draft(title));
    }
    let last_change = Instant::now();

    sleep(Duration::from_millis(3000)).await;
    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, draft("Rust!"));
    let waited = calls[0].1 - last_change;
    assert!(waited >= Duration::from_millis(900) && waited <= Duration::from_millis(1100));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reverting_to_saved_data_skips_save() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft("Intro"), always_ok(&calls));

    autosave.update(draft("Intro!"));
    sleep(Duration::from_millis(200)).await;
    autosave.update(draft("Intro"));
    sleep(Duration::from_millis(3000)).await;

    assert!(calls.lock().is_empty());
    assert_eq!(autosave.status(), SaveStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_initial_data_is_not_a_change() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft("Intro"), always_ok(&calls));
    autosave.update(draft("Intro"));
    sleep(Duration::from_secs(5)).await;

    assert!(calls.lock().is_empty());
    assert!(!autosave.has_unsaved_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_successful_save_shows_saved_then_idle() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft(""),
      always_ok(&calls).saved_display(Duration::from_millis(2000)),
    );
    let mut rx = autosave.subscribe();

    autosave.update(draft("Ownership"));
    assert!(autosave.has_unsaved_changes());
    sleep(Duration::from_millis(1100)).await;

    assert_eq!(autosave.status(), SaveStatus::Saved);
    assert_eq!(autosave.last_saved(), draft("Ownership"));
    assert!(!autosave.has_unsaved_changes());
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), SaveStatus::Saved);

    sleep(Duration::from_millis(2100)).await;
    assert_eq!(autosave.status(), SaveStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_unsaved_changes_while_saving() {
    let autosave = AutoSave::new(
      draft(""),
      AutoSaveOptions::new(|_: Draft| async {
        sleep(Duration::from_millis(500)).await;
        Ok::<_, EngineError>(Envelope::<()>::ok_empty())
      })
      .delay(Duration::from_millis(1000)),
    );

    autosave.update(draft("Borrowing"));
    sleep(Duration::from_millis(1200)).await;
    assert_eq!(autosave.status(), SaveStatus::Saving);
    assert!(!autosave.has_unsaved_changes());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(autosave.status(), SaveStatus::Saved);
    assert!(!autosave.has_unsaved_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_change_during_save_is_saved_afterwards() {
    let calls = Calls::default();
    let recorder = Arc::clone(&calls);
    let autosave = AutoSave::new(
      draft(""),
      AutoSaveOptions::new(move |data: Draft| {
        recorder.lock().push((data, Instant::now()));
        async {
          sleep(Duration::from_millis(1500)).await;
          Ok::<_, EngineError>(Envelope::<()>::ok_empty())
        }
      })
      .delay(Duration::from_millis(1000)),
    );

    autosave.update(draft("one"));
    sleep(Duration::from_millis(1200)).await;
    autosave.update(draft("two"));
    sleep(Duration::from_secs(6)).await;

    let calls = calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, draft("two"));
    assert_eq!(autosave.last_saved(), draft("two"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_conflict_holds_until_resolved() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft("Base"), recording(&calls, |_| Err(conflict())));

    autosave.update(draft("Local Title"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Conflict);

    for title in ["a", "b", "c"] {
      autosave.update(draft(title));
      sleep(Duration::from_millis(1500)).await;
    }
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(autosave.status(), SaveStatus::Conflict);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_envelope_with_version_marker_holds_conflict() {
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let autosave = AutoSave::new(
      draft("Base"),
      AutoSaveOptions::new(move |_: Draft| {
        *counter.lock() += 1;
        async { Ok::<_, EngineError>(Envelope::<()>::failure("Version conflict: draft was modified")) }
      })
      .delay(Duration::from_millis(1000)),
    );

    autosave.update(draft("Local"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Conflict);
    assert!(autosave.last_error().unwrap().is_conflict());

    autosave.update(draft("Local again"));
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(*calls.lock(), 1);
    assert_eq!(autosave.status(), SaveStatus::Conflict);
  }

  #[tokio::test(start_paused = true)]
  async fn test_plain_failed_envelope_is_an_error() {
    let autosave = AutoSave::new(
      draft("Base"),
      AutoSaveOptions::new(|_: Draft| async {
        Ok::<_, EngineError>(Envelope::<()>::failure("Description is too long"))
      })
      .delay(Duration::from_millis(1000)),
    );

    autosave.update(draft("Local"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Error);
    assert_eq!(autosave.last_error().unwrap().kind, ErrorKind::Rejected);
  }

  #[test]
  fn test_update_outside_runtime_waits_for_force_save() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft(""), always_ok(&calls));
    autosave.update(draft("Offline"));
    autosave.set_enabled(true);
    assert!(autosave.has_unsaved_changes());
    assert_eq!(autosave.status(), SaveStatus::Idle);

    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .unwrap();
    runtime.block_on(autosave.force_save()).unwrap();
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(autosave.last_saved(), draft("Offline"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_conflict_resolved_with_remote_copy() {
    let calls = Calls::default();
    let conflicts = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&conflicts);
    let autosave = AutoSave::new(
      draft("Base"),
      recording(&calls, |_| Err(conflict())).on_conflict(move |e| {
        assert!(e.is_conflict());
        *seen.lock() += 1;
      }),
    );

    autosave.update(draft("Local Title"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Conflict);
    assert_eq!(*conflicts.lock(), 1);
    assert_eq!(autosave.conflict_data(), Some(json!({"title": "Remote Title"})));

    autosave
      .resolve_conflict(ConflictResolution::AcceptRemote(Some(draft("Remote Title"))))
      .await
      .unwrap();
    assert_eq!(autosave.last_saved().title, "Remote Title");
    assert_eq!(autosave.current().title, "Remote Title");
    assert_eq!(autosave.status(), SaveStatus::Saved);
    assert!(!autosave.has_unsaved_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_accept_remote_falls_back_to_conflict_data() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft("Base"), recording(&calls, |_| Err(conflict())));
    autosave.update(draft("Local Title"));
    sleep(Duration::from_millis(1100)).await;

    autosave
      .resolve_conflict(ConflictResolution::AcceptRemote(None))
      .await
      .unwrap();
    assert_eq!(autosave.last_saved(), draft("Remote Title"));
    assert!(autosave.conflict_data().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_keep_local_overwrites() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft("Base"),
      recording(&calls, |n| if n == 0 { Err(conflict()) } else { Ok(()) }),
    );
    autosave.update(draft("Local Title"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Conflict);

    autosave
      .resolve_conflict(ConflictResolution::KeepLocal)
      .await
      .unwrap();
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(autosave.status(), SaveStatus::Saved);
    assert_eq!(autosave.last_saved(), draft("Local Title"));
  }

  #[tokio::test]
  async fn test_resolving_without_conflict_is_an_error() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft("Base"), always_ok(&calls));
    let err = autosave
      .resolve_conflict(ConflictResolution::AcceptRemote(None))
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_is_retried_on_next_change() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft(""),
      recording(&calls, |n| {
        if n == 0 {
          Err(EngineError::new(ErrorKind::Unavailable, "Service unavailable."))
        } else {
          Ok(())
        }
      }),
    );

    autosave.update(draft("one"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Error);
    assert_eq!(autosave.last_error().unwrap().kind, ErrorKind::Unavailable);
    assert!(autosave.has_unsaved_changes());

    autosave.update(draft("one!"));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(autosave.status(), SaveStatus::Saved);
    assert_eq!(calls.lock().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_force_save_retries_timeouts() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft(""),
      recording(&calls, |n| {
        if n < 2 {
          Err(EngineError::timeout("Request timed out"))
        } else {
          Ok(())
        }
      }),
    );
    autosave.update(draft("Lifetimes"));

    let start = Instant::now();
    autosave.force_save().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2000) && elapsed < Duration::from_millis(2100));
    assert_eq!(calls.lock().len(), 3);
    assert_eq!(autosave.status(), SaveStatus::Saved);

    // The debounce timer armed by `update` was cancelled
    sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.lock().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_force_save_gives_up_after_two_timeout_retries() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft(""),
      recording(&calls, |_| Err(EngineError::timeout("Request timed out"))),
    );
    autosave.update(draft("Traits"));

    let err = autosave.force_save().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(calls.lock().len(), 3);
    assert_eq!(autosave.status(), SaveStatus::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_force_save_never_retries_conflict() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft(""), recording(&calls, |_| Err(conflict())));
    autosave.update(draft("Macros"));

    let err = autosave.force_save().await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(autosave.status(), SaveStatus::Conflict);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_session_does_not_save() {
    let calls = Calls::default();
    let autosave = AutoSave::new(draft(""), always_ok(&calls).enabled(false));
    autosave.update(draft("Async"));
    sleep(Duration::from_secs(3)).await;
    assert!(calls.lock().is_empty());

    autosave.set_enabled(true);
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(calls.lock().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_custom_comparator_ignores_volatile_fields() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft("Intro"),
      always_ok(&calls).has_data_changed(|current, saved| current.title != saved.title),
    );

    autosave.update(Draft {
      title: "Intro".to_string(),
      cursor: 42,
    });
    sleep(Duration::from_secs(3)).await;
    assert!(calls.lock().is_empty());
    assert!(!autosave.has_unsaved_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_transform_shapes_payload_only() {
    let calls = Calls::default();
    let autosave = AutoSave::new(
      draft(""),
      always_ok(&calls).transform(|mut d: Draft| {
        d.title = d.title.trim().to_string();
        d
      }),
    );

    autosave.update(draft("  Modules  "));
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(calls.lock()[0].0, draft("Modules"));
    assert_eq!(autosave.last_saved(), draft("  Modules  "));
  }

  #[tokio::test(start_paused = true)]
  async fn test_conflict_notification_persists_until_resolved() {
    let calls = Calls::default();
    let center = Arc::new(NotificationCenter::new(Duration::from_secs(4)));
    let autosave = AutoSave::new(
      draft("Base"),
      recording(&calls, |_| Err(conflict())).notifier(center.clone(), "autosave-d1"),
    );

    autosave.update(draft("Local"));
    sleep(Duration::from_millis(1100)).await;
    sleep(Duration::from_secs(10)).await;

    let visible = center.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].level, Level::Persistent);

    autosave
      .resolve_conflict(ConflictResolution::AcceptRemote(None))
      .await
      .unwrap();
    assert!(center.visible().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_save_notifies_with_suggestion() {
    let calls = Calls::default();
    let center = Arc::new(NotificationCenter::new(Duration::from_secs(4)));
    let autosave = AutoSave::new(
      draft(""),
      recording(&calls, |_| Err(EngineError::network("Could not save draft."))).notifier(center.clone(), "autosave-d1"),
    );

    autosave.update(draft("Closures"));
    sleep(Duration::from_millis(1100)).await;

    let visible = center.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].operation_id, "autosave-d1-error");
    assert_eq!(
      visible[0].message,
      "Could not save draft. Check your connection and try again."
    );
  }
}
