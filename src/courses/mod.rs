//! Course administration: the domain the demo console drives the engine with.

pub mod api;
pub mod draft;
pub mod keys;
pub mod types;

pub use api::{CourseApi, SimulatedBackend};
pub use draft::DraftSession;
pub use types::{Course, CourseDraft, RenameCourse};

use std::sync::Arc;
use tracing::debug;

use crate::autosave::AutoSaveTimings;
use crate::cache::CacheStore;
use crate::envelope::{EngineError, Envelope};
use crate::mutation::Mutation;
use crate::notify::Notifier;
use crate::query::Query;
use crate::retry::{RetryController, RetryPolicy};

/// Course operations wired to the shared cache and notifier.
#[derive(Clone)]
pub struct CourseService {
  api: CourseApi,
  store: CacheStore,
  notifier: Arc<dyn Notifier>,
  timings: AutoSaveTimings,
  delete: Mutation<String, ()>,
  rename: Mutation<RenameCourse, Course>,
  save_draft: Mutation<CourseDraft, Course>,
}

impl CourseService {
  pub fn new(
    api: CourseApi,
    store: CacheStore,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    timings: AutoSaveTimings,
  ) -> Self {
    let delete = Mutation::new("delete-course", &store, {
      let api = api.clone();
      move |course_id: String| {
        let api = api.clone();
        async move { api.delete_course(&course_id).await }
      }
    })
    .on_mutate(|scope, course_id| {
      let snapshot = scope.snapshot(&keys::all());
      scope.update::<Vec<Course>, _>(&keys::list(), |list| {
        list.map(|courses| courses.into_iter().filter(|c| &c.id != course_id).collect())
      })?;
      Ok(snapshot)
    })
    .on_settled(|_, _, store| {
      store.invalidate(&keys::list().into());
    })
    .retry(RetryController::new(retry))
    .notifier(notifier.clone());

    let rename = Mutation::new("rename-course", &store, {
      let api = api.clone();
      move |rename: RenameCourse| {
        let api = api.clone();
        async move { api.rename_course(&rename).await }
      }
    })
    .on_mutate(|scope, rename| {
      let snapshot = scope.snapshot(&keys::all());
      scope.update::<Vec<Course>, _>(&keys::list(), |list| {
        list.map(|courses| {
          courses
            .into_iter()
            .map(|c| {
              if c.id == rename.course_id {
                Course {
                  title: rename.title.clone(),
                  ..c
                }
              } else {
                c
              }
            })
            .collect()
        })
      })?;
      scope.update::<Course, _>(&keys::detail(&rename.course_id), |course| {
        course.map(|c| Course {
          title: rename.title.clone(),
          ..c
        })
      })?;
      Ok(snapshot)
    })
    .commit_to(|rename: &RenameCourse| keys::detail(&rename.course_id))
    .on_success(|envelope, _, store| {
      if let Some(course) = &envelope.data {
        draft::replace_in_list(store, course);
      }
    })
    .on_settled(|_, _, store| {
      store.invalidate(&keys::list().into());
    })
    .retry(RetryController::new(retry))
    .notifier(notifier.clone());

    // Draft sessions own their notifications, so this mutation stays silent
    let save_draft = Mutation::new("save-draft", &store, {
      let api = api.clone();
      move |draft: CourseDraft| {
        let api = api.clone();
        async move { api.save_draft(&draft).await }
      }
    })
    .commit_to(|draft: &CourseDraft| keys::detail(&draft.course_id))
    .on_success(|envelope, _, store| {
      if let Some(course) = &envelope.data {
        draft::replace_in_list(store, course);
      }
    })
    .silent();

    Self {
      api,
      store,
      notifier,
      timings,
      delete,
      rename,
      save_draft,
    }
  }

  pub fn api(&self) -> &CourseApi {
    &self.api
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn notifier(&self) -> &Arc<dyn Notifier> {
    &self.notifier
  }

  /// Observer over the course list.
  pub fn list_query(&self) -> Query<Vec<Course>> {
    let api = self.api.clone();
    Query::new(&self.store, keys::list(), move || {
      let api = api.clone();
      async move { api.list_courses().await }
    })
  }

  pub async fn delete(&self, course_id: &str) -> Result<Envelope<()>, EngineError> {
    self.delete.mutate(course_id.to_string()).await
  }

  pub async fn rename(&self, course_id: &str, title: &str) -> Result<Envelope<Course>, EngineError> {
    self
      .rename
      .mutate(RenameCourse {
        course_id: course_id.to_string(),
        title: title.to_string(),
      })
      .await
  }

  pub fn delete_mutation(&self) -> &Mutation<String, ()> {
    &self.delete
  }

  pub fn rename_mutation(&self) -> &Mutation<RenameCourse, Course> {
    &self.rename
  }

  pub fn save_draft_mutation(&self) -> &Mutation<CourseDraft, Course> {
    &self.save_draft
  }

  /// Start editing a course's description.
  pub fn open_draft(&self, course: &Course) -> DraftSession {
    DraftSession::open(
      self.save_draft.clone(),
      &self.store,
      self.notifier.clone(),
      self.timings,
      course,
    )
  }

  /// Edit a course behind the console's back, then refresh what is cached.
  pub fn simulate_remote_edit(&self, course_id: &str) -> Result<Course, EngineError> {
    let course = self.api.simulate_remote_edit(course_id)?;
    debug!(course_id, version = course.version, "remote edit applied");
    self.store.invalidate(&keys::list().into());
    Ok(course)
  }
}
