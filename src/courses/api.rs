use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::courses::types::{Course, CourseDraft, RenameCourse};
use crate::envelope::{EngineError, Envelope, ErrorKind};
use crate::transport::HttpClient;

/// Course backend, either a real HTTP API or the in-process simulation.
#[derive(Clone, Debug)]
pub enum CourseApi {
  Simulated(SimulatedBackend),
  Http(HttpClient),
}

impl CourseApi {
  /// Short description for the header
  pub fn label(&self) -> String {
    match self {
      Self::Simulated(_) => "simulated".to_string(),
      Self::Http(client) => client
        .base_url()
        .host_str()
        .unwrap_or("api")
        .to_string(),
    }
  }

  pub fn is_simulated(&self) -> bool {
    matches!(self, Self::Simulated(_))
  }

  pub async fn list_courses(&self) -> Result<Vec<Course>, EngineError> {
    match self {
      Self::Simulated(sim) => sim.list().await,
      Self::Http(client) => Ok(
        client
          .get::<Vec<Course>>("courses")
          .await?
          .into_result()?
          .data
          .unwrap_or_default(),
      ),
    }
  }

  pub async fn get_course(&self, course_id: &str) -> Result<Course, EngineError> {
    match self {
      Self::Simulated(sim) => sim.get(course_id).await,
      Self::Http(client) => client
        .get::<Course>(&format!("courses/{}", course_id))
        .await?
        .into_result()?
        .data
        .ok_or_else(|| EngineError::new(ErrorKind::Decode, "Course response had no data")),
    }
  }

  pub async fn delete_course(&self, course_id: &str) -> Result<Envelope<()>, EngineError> {
    match self {
      Self::Simulated(sim) => sim.delete(course_id).await,
      Self::Http(client) => client.delete(&format!("courses/{}", course_id)).await,
    }
  }

  pub async fn rename_course(&self, rename: &RenameCourse) -> Result<Envelope<Course>, EngineError> {
    match self {
      Self::Simulated(sim) => sim.rename(rename).await,
      Self::Http(client) => {
        client
          .patch(
            &format!("courses/{}", rename.course_id),
            &json!({ "title": rename.title }),
          )
          .await
      }
    }
  }

  /// Save the description. The server rejects the write with a conflict when
  /// `draft.version` is not its current version.
  pub async fn save_draft(&self, draft: &CourseDraft) -> Result<Envelope<Course>, EngineError> {
    match self {
      Self::Simulated(sim) => sim.save_draft(draft).await,
      Self::Http(client) => {
        client
          .put(&format!("courses/{}/draft", draft.course_id), draft)
          .await
      }
    }
  }

  /// Edit a course behind the console's back.
  pub fn simulate_remote_edit(&self, course_id: &str) -> Result<Course, EngineError> {
    match self {
      Self::Simulated(sim) => sim.remote_edit(course_id),
      Self::Http(_) => Err(EngineError::new(
        ErrorKind::Validation,
        "Remote edits can only be simulated against the demo backend",
      )),
    }
  }
}

#[derive(Debug)]
struct SimState {
  courses: Vec<Course>,
  writes: u32,
}

/// In-memory backend with latency, failure injection and version checks.
#[derive(Clone, Debug)]
pub struct SimulatedBackend {
  state: Arc<Mutex<SimState>>,
  latency: Duration,
  fail_every: u32,
}

impl SimulatedBackend {
  /// Backend seeded with a handful of courses.
  pub fn new(latency: Duration, fail_every: u32) -> Self {
    Self::with_courses(seed_courses(), latency, fail_every)
  }

  pub fn with_courses(courses: Vec<Course>, latency: Duration, fail_every: u32) -> Self {
    Self {
      state: Arc::new(Mutex::new(SimState { courses, writes: 0 })),
      latency,
      fail_every,
    }
  }

  async fn delay(&self) {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
  }

  /// Count a write and fail every `fail_every`th one.
  fn inject_failure(&self, state: &mut SimState) -> Result<(), EngineError> {
    state.writes += 1;
    if self.fail_every > 0 && state.writes % self.fail_every == 0 {
      debug!(write = state.writes, "injecting simulated failure");
      return Err(EngineError::from_response(
        Some(503),
        Some("service_unavailable".to_string()),
        "The server is temporarily unavailable",
      ));
    }
    Ok(())
  }

  fn not_found(course_id: &str) -> EngineError {
    EngineError::from_response(Some(404), None, format!("Course {} not found", course_id))
  }

  pub async fn list(&self) -> Result<Vec<Course>, EngineError> {
    self.delay().await;
    Ok(self.state.lock().courses.clone())
  }

  pub async fn get(&self, course_id: &str) -> Result<Course, EngineError> {
    self.delay().await;
    self
      .state
      .lock()
      .courses
      .iter()
      .find(|c| c.id == course_id)
      .cloned()
      .ok_or_else(|| Self::not_found(course_id))
  }

  pub async fn delete(&self, course_id: &str) -> Result<Envelope<()>, EngineError> {
    self.delay().await;
    let mut state = self.state.lock();
    self.inject_failure(&mut state)?;
    let before = state.courses.len();
    state.courses.retain(|c| c.id != course_id);
    if state.courses.len() == before {
      return Err(Self::not_found(course_id));
    }
    Ok(Envelope::ok_empty().with_message("Course deleted"))
  }

  pub async fn rename(&self, rename: &RenameCourse) -> Result<Envelope<Course>, EngineError> {
    self.delay().await;
    let title = rename.title.trim();
    if title.is_empty() {
      return Err(EngineError::from_response(
        Some(422),
        Some("validation_error".to_string()),
        "Title is required",
      ));
    }

    let mut state = self.state.lock();
    self.inject_failure(&mut state)?;
    let course = state
      .courses
      .iter_mut()
      .find(|c| c.id == rename.course_id)
      .ok_or_else(|| Self::not_found(&rename.course_id))?;
    course.title = title.to_string();
    course.version += 1;
    course.updated_at = Utc::now();
    Ok(Envelope::ok(course.clone()).with_message("Course renamed"))
  }

  pub async fn save_draft(&self, draft: &CourseDraft) -> Result<Envelope<Course>, EngineError> {
    self.delay().await;
    let mut state = self.state.lock();
    self.inject_failure(&mut state)?;
    let course = state
      .courses
      .iter_mut()
      .find(|c| c.id == draft.course_id)
      .ok_or_else(|| Self::not_found(&draft.course_id))?;

    if course.version != draft.version {
      info!(
        course_id = %course.id,
        expected = course.version,
        got = draft.version,
        "rejecting stale draft"
      );
      return Err(
        EngineError::from_response(
          Some(409),
          Some("version_conflict".to_string()),
          "This course was changed by someone else",
        )
        .with_conflict_data(serde_json::to_value(&*course)?),
      );
    }

    course.description = draft.description.clone();
    course.version += 1;
    course.updated_at = Utc::now();
    Ok(Envelope::ok(course.clone()).with_message("Draft saved"))
  }

  pub fn remote_edit(&self, course_id: &str) -> Result<Course, EngineError> {
    let mut state = self.state.lock();
    let course = state
      .courses
      .iter_mut()
      .find(|c| c.id == course_id)
      .ok_or_else(|| Self::not_found(course_id))?;
    course.description = format!("{} [edited elsewhere]", course.description.trim_end());
    course.version += 1;
    course.updated_at = Utc::now();
    info!(course_id, version = course.version, "simulated remote edit");
    Ok(course.clone())
  }
}

fn seed_courses() -> Vec<Course> {
  let now = Utc::now();
  [
    ("c1", "Rust Fundamentals", "Ownership, borrowing and the type system."),
    ("c2", "Async Rust", "Futures, executors and structured concurrency."),
    ("c3", "Systems Design", "Caches, queues and consistency trade-offs."),
    ("c4", "Terminal UIs", "Building interfaces with ratatui."),
  ]
  .into_iter()
  .map(|(id, title, description)| Course {
    id: id.to_string(),
    title: title.to_string(),
    description: description.to_string(),
    version: 1,
    updated_at: now,
  })
  .collect()
}
