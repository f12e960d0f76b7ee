//! User-facing notification dispatch with per-operation deduplication.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Fields conventionally holding a resource id, checked in order.
const ID_FIELDS: &[&str] = &[
  "id",
  "_id",
  "courseId",
  "userId",
  "lessonId",
  "chapterId",
  "course_id",
  "user_id",
  "lesson_id",
  "chapter_id",
];

const ERROR_SUFFIX: &str = "-error";

/// Stable id for one logical action, e.g. `delete-course-c1`.
///
/// Object variables are searched for a conventional id field. A bare string
/// or number is itself the resource id. Without an id the name is used as is.
pub fn operation_id(name: &str, variables: &Value) -> String {
  let id = match variables {
    Value::Object(map) => ID_FIELDS.iter().find_map(|field| map.get(*field).and_then(id_text)),
    other => id_text(other),
  };
  match id {
    Some(id) => format!("{}-{}", name, id),
    None => name.to_string(),
  }
}

fn id_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Id used for the failure notification of an operation.
pub fn error_id(operation_id: &str) -> String {
  format!("{}{}", operation_id, ERROR_SUFFIX)
}

/// Sink for user-visible messages.
///
/// A second call with the same `operation_id` while the first message is
/// still visible replaces it rather than stacking another one.
pub trait Notifier: Send + Sync {
  fn success(&self, message: &str, operation_id: &str);

  fn error(&self, message: &str, operation_id: &str);

  /// Message that stays until dismissed, used for unresolved conflicts.
  fn persistent(&self, message: &str, operation_id: &str) {
    self.error(message, operation_id);
  }

  fn dismiss(&self, _operation_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Success,
  Error,
  /// Stays visible until dismissed
  Persistent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub operation_id: String,
  pub level: Level,
  pub message: String,
  pub shown_at: Instant,
  /// How many earlier messages this one replaced
  pub replaced: u32,
}

impl Notification {
  fn expired(&self, window: Duration) -> bool {
    self.level != Level::Persistent && self.shown_at.elapsed() >= window
  }
}

struct Slot {
  logical_id: String,
  notification: Notification,
}

/// In-memory notifier holding what the UI should currently show.
///
/// Success and failure of one operation (`x` and `x-error`) share a slot, so
/// a failed attempt followed by a successful retry ends with one message
/// reflecting the later outcome.
#[derive(Clone)]
pub struct NotificationCenter {
  slots: Arc<Mutex<Vec<Slot>>>,
  display_window: Duration,
}

impl Default for NotificationCenter {
  fn default() -> Self {
    Self::new(Duration::from_millis(4000))
  }
}

impl NotificationCenter {
  pub fn new(display_window: Duration) -> Self {
    Self {
      slots: Arc::new(Mutex::new(Vec::new())),
      display_window,
    }
  }

  pub fn display_window(&self) -> Duration {
    self.display_window
  }

  fn logical_id(operation_id: &str) -> &str {
    operation_id.strip_suffix(ERROR_SUFFIX).unwrap_or(operation_id)
  }

  fn push(&self, level: Level, message: &str, operation_id: &str) {
    let logical_id = Self::logical_id(operation_id);
    let mut slots = self.slots.lock();
    slots.retain(|s| !s.notification.expired(self.display_window));

    let notification = Notification {
      operation_id: operation_id.to_string(),
      level,
      message: message.to_string(),
      shown_at: Instant::now(),
      replaced: 0,
    };

    match slots.iter_mut().find(|s| s.logical_id == logical_id) {
      Some(slot) => {
        debug!(operation_id, "replacing visible notification");
        let replaced = slot.notification.replaced + 1;
        slot.notification = Notification {
          replaced,
          ..notification
        };
      }
      None => slots.push(Slot {
        logical_id: logical_id.to_string(),
        notification,
      }),
    }
  }

  /// Messages currently visible, oldest first.
  pub fn visible(&self) -> Vec<Notification> {
    let mut slots = self.slots.lock();
    slots.retain(|s| !s.notification.expired(self.display_window));
    slots.iter().map(|s| s.notification.clone()).collect()
  }

  /// Drop expired messages. Returns how many were removed.
  pub fn prune(&self) -> usize {
    let mut slots = self.slots.lock();
    let before = slots.len();
    slots.retain(|s| !s.notification.expired(self.display_window));
    before - slots.len()
  }

  pub fn clear(&self) {
    self.slots.lock().clear();
  }
}

impl Notifier for NotificationCenter {
  fn success(&self, message: &str, operation_id: &str) {
    info!(operation_id, "{}", message);
    self.push(Level::Success, message, operation_id);
  }

  fn error(&self, message: &str, operation_id: &str) {
    info!(operation_id, "error shown: {}", message);
    self.push(Level::Error, message, operation_id);
  }

  fn persistent(&self, message: &str, operation_id: &str) {
    info!(operation_id, "persistent message shown: {}", message);
    self.push(Level::Persistent, message, operation_id);
  }

  fn dismiss(&self, operation_id: &str) {
    let logical_id = Self::logical_id(operation_id);
    self.slots.lock().retain(|s| s.logical_id != logical_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_operation_id_from_conventional_fields() {
    assert_eq!(
      operation_id("delete-course", &json!({"courseId": "c1"})),
      "delete-course-c1"
    );
    assert_eq!(operation_id("update-user", &json!({"_id": 42})), "update-user-42");
    assert_eq!(
      operation_id("reorder-chapters", &json!({"chapter_id": "ch9", "position": 2})),
      "reorder-chapters-ch9"
    );
  }

  #[test]
  fn test_operation_id_prefers_id_over_other_fields() {
    assert_eq!(
      operation_id("save", &json!({"lessonId": "l1", "id": "x"})),
      "save-x"
    );
  }

  #[test]
  fn test_operation_id_from_bare_values_and_fallback() {
    assert_eq!(operation_id("delete-course", &json!("c7")), "delete-course-c7");
    assert_eq!(operation_id("logout", &json!(null)), "logout");
    assert_eq!(operation_id("search", &json!({"query": "rust"})), "search");
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_operation_replaces_instead_of_stacking() {
    let center = NotificationCenter::new(Duration::from_secs(4));
    center.error("Could not delete course.", &error_id("delete-course-c1"));
    tokio::time::advance(Duration::from_millis(500)).await;
    center.success("Course deleted", "delete-course-c1");

    let visible = center.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].level, Level::Success);
    assert_eq!(visible[0].message, "Course deleted");
    assert_eq!(visible[0].replaced, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_distinct_operations_stack() {
    let center = NotificationCenter::new(Duration::from_secs(4));
    center.success("Course deleted", "delete-course-c1");
    center.success("Course deleted", "delete-course-c2");
    assert_eq!(center.visible().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_messages_expire_but_persistent_ones_stay() {
    let center = NotificationCenter::new(Duration::from_secs(4));
    center.success("Saved", "save-draft-d1");
    center.persistent("Someone else edited this draft.", "autosave-d1");

    tokio::time::advance(Duration::from_secs(5)).await;
    let visible = center.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].level, Level::Persistent);

    center.dismiss("autosave-d1");
    assert!(center.visible().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_message_is_not_counted_as_replaced() {
    let center = NotificationCenter::new(Duration::from_secs(1));
    center.success("Saved", "save-1");
    tokio::time::advance(Duration::from_secs(2)).await;
    center.success("Saved again", "save-1");
    let visible = center.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].replaced, 0);
  }
}
