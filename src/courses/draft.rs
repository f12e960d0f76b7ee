//! Autosaved description editing for one course.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::autosave::{AutoSave, AutoSaveOptions, AutoSaveTimings, ConflictResolution, SaveStatus};
use crate::cache::{CacheStore, KeyFilter};
use crate::courses::keys;
use crate::courses::types::{Course, CourseDraft};
use crate::envelope::EngineError;
use crate::mutation::Mutation;
use crate::notify::Notifier;

/// Operation id used for a course's draft notifications
pub fn operation_id(course_id: &str) -> String {
  format!("save-draft-{}", course_id)
}

/// Swap a course the server returned into the cached list.
pub(crate) fn replace_in_list(store: &CacheStore, course: &Course) {
  let replaced = store.update_query_data::<Vec<Course>, _>(&keys::list(), |list| {
    list.map(|courses| {
      courses
        .into_iter()
        .map(|c| if c.id == course.id { course.clone() } else { c })
        .collect()
    })
  });
  if let Err(e) = replaced {
    warn!(course_id = %course.id, "could not update course list: {}", e);
  }
}

/// An editing session: the autosave engine plus the server version the
/// local text is based on.
///
/// The base version is tracked apart from the cache. A background refetch
/// may bring in a newer server copy; saves must still carry the version the
/// local text was based on. Saves run through the `save-draft` mutation, so
/// the session itself never writes the cache.
#[derive(Clone)]
pub struct DraftSession {
  course_id: String,
  autosave: AutoSave<CourseDraft>,
  base_version: Arc<AtomicU64>,
  store: CacheStore,
}

impl DraftSession {
  pub fn open(
    save: Mutation<CourseDraft, Course>,
    store: &CacheStore,
    notifier: Arc<dyn Notifier>,
    timings: AutoSaveTimings,
    course: &Course,
  ) -> Self {
    let base_version = Arc::new(AtomicU64::new(course.version));

    let options = AutoSaveOptions::new({
      let base_version = base_version.clone();
      move |draft: CourseDraft| {
        let save = save.clone();
        let base_version = base_version.clone();
        async move {
          let envelope = save.mutate(draft).await?;
          if let Some(saved) = &envelope.data {
            base_version.store(saved.version, Ordering::SeqCst);
          }
          Ok::<_, EngineError>(envelope)
        }
      }
    })
    .timings(timings)
    .has_data_changed(|current: &CourseDraft, saved: &CourseDraft| current.differs(saved))
    .transform({
      let base_version = base_version.clone();
      move |draft: CourseDraft| CourseDraft {
        version: base_version.load(Ordering::SeqCst),
        ..draft
      }
    })
    .notifier(notifier, operation_id(&course.id));

    debug!(course_id = %course.id, version = course.version, "draft session opened");
    Self {
      course_id: course.id.clone(),
      autosave: AutoSave::new(CourseDraft::of(course), options),
      base_version,
      store: store.clone(),
    }
  }

  pub fn course_id(&self) -> &str {
    &self.course_id
  }

  pub fn autosave(&self) -> &AutoSave<CourseDraft> {
    &self.autosave
  }

  pub fn base_version(&self) -> u64 {
    self.base_version.load(Ordering::SeqCst)
  }

  pub fn status(&self) -> SaveStatus {
    self.autosave.status()
  }

  pub fn description(&self) -> String {
    self.autosave.current().description
  }

  /// Feed the latest editor text.
  pub fn edit(&self, description: impl Into<String>) {
    self.autosave.update(CourseDraft {
      course_id: self.course_id.clone(),
      description: description.into(),
      version: self.base_version(),
    });
  }

  pub async fn save_now(&self) -> Result<(), EngineError> {
    self.autosave.force_save().await
  }

  /// Overwrite the server copy with the local text.
  pub async fn keep_local(&self) -> Result<(), EngineError> {
    if let Some(data) = self.autosave.conflict_data() {
      let remote: CourseDraft = serde_json::from_value(data)?;
      self.base_version.store(remote.version, Ordering::SeqCst);
    }
    self.autosave.resolve_conflict(ConflictResolution::KeepLocal).await
  }

  /// Drop the local text and continue from the server copy. Cached copies
  /// of the course are marked stale so observers refetch it.
  pub async fn accept_remote(&self) -> Result<(), EngineError> {
    let Some(data) = self.autosave.conflict_data() else {
      return self
        .autosave
        .resolve_conflict(ConflictResolution::AcceptRemote(None))
        .await;
    };

    let remote: CourseDraft = serde_json::from_value(data)?;
    let version = remote.version;
    self
      .autosave
      .resolve_conflict(ConflictResolution::AcceptRemote(Some(remote)))
      .await?;
    self.base_version.store(version, Ordering::SeqCst);
    self.store.invalidate(&KeyFilter::from(keys::detail(&self.course_id)));
    self.store.invalidate(&KeyFilter::from(keys::list()));
    Ok(())
  }
}

impl std::fmt::Debug for DraftSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DraftSession")
      .field("course_id", &self.course_id)
      .field("base_version", &self.base_version())
      .field("autosave", &self.autosave)
      .finish()
  }
}
