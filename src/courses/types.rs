use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A course as the admin console lists it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub description: String,
  /// Bumped by the server on every write
  pub version: u64,
  #[serde(default = "Utc::now")]
  pub updated_at: DateTime<Utc>,
}

/// The part of a course the description editor autosaves.
///
/// `version` is the server version the edit is based on. A course body
/// deserializes into a draft too (`id` is accepted for `courseId`), so the
/// server's copy sent with a conflict can be taken as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseDraft {
  #[serde(alias = "id")]
  pub course_id: String,
  #[serde(default)]
  pub description: String,
  pub version: u64,
}

impl CourseDraft {
  pub fn of(course: &Course) -> Self {
    Self {
      course_id: course.id.clone(),
      description: course.description.clone(),
      version: course.version,
    }
  }

  /// Only the text matters for change detection; version bumps alone never
  /// trigger a save.
  pub fn differs(&self, other: &CourseDraft) -> bool {
    self.description != other.description
  }
}

/// Variables of the rename mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameCourse {
  pub course_id: String,
  pub title: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_course_body_reads_as_draft() {
    let body = json!({
      "id": "c1",
      "title": "Rust 101",
      "description": "Remote text",
      "version": 7,
      "updatedAt": "2026-01-02T03:04:05Z"
    });
    let draft: CourseDraft = serde_json::from_value(body).unwrap();
    assert_eq!(draft.course_id, "c1");
    assert_eq!(draft.description, "Remote text");
    assert_eq!(draft.version, 7);
  }

  #[test]
  fn test_version_alone_is_not_a_change() {
    let a = CourseDraft {
      course_id: "c1".to_string(),
      description: "text".to_string(),
      version: 1,
    };
    let b = CourseDraft { version: 2, ..a.clone() };
    assert!(!a.differs(&b));
    assert!(a.differs(&CourseDraft {
      description: "other".to_string(),
      ..a.clone()
    }));
  }

  #[test]
  fn test_rename_variables_carry_course_id() {
    let vars = RenameCourse {
      course_id: "c4".to_string(),
      title: "New".to_string(),
    };
    let value = serde_json::to_value(&vars).unwrap();
    assert_eq!(crate::notify::operation_id("rename-course", &value), "rename-course-c4");
  }
}
