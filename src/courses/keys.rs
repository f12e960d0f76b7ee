//! Cache keys for course data. Everything lives under one root so a single
//! prefix filter snapshots or invalidates all of it.

use crate::cache::{KeyFilter, QueryKey};
use crate::query_key;

pub const ROOT: &str = "admin-courses";

pub fn list() -> QueryKey {
  query_key!["admin-courses", "list"]
}

pub fn detail(course_id: &str) -> QueryKey {
  query_key!["admin-courses", "detail", course_id]
}

pub fn all() -> KeyFilter {
  KeyFilter::root(ROOT)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_share_root() {
    let filter = all();
    assert!(filter.matches(&list()));
    assert!(filter.matches(&detail("c1")));
    assert!(!filter.matches(&QueryKey::from("profile")));
  }

  #[test]
  fn test_detail_keys_differ_by_id() {
    assert_eq!(detail("c1"), detail("c1"));
    assert_ne!(detail("c1"), detail("c2"));
  }
}
