//! Structural query keys and the filters that select them.

use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Ordered sequence of segments identifying one cached result.
///
/// Keys compare by deep structural equality. Hashing and equality go through
/// a canonical JSON rendering with object fields sorted, so `{"a":1,"b":2}`
/// and `{"b":2,"a":1}` are the same segment.
#[derive(Clone)]
pub struct QueryKey {
  segments: Vec<Value>,
  canonical: String,
}

impl QueryKey {
  pub fn new(segments: Vec<Value>) -> Self {
    let mut canonical = String::new();
    write_canonical(&Value::Array(segments.clone()), &mut canonical);
    Self {
      segments,
      canonical,
    }
  }

  pub fn segments(&self) -> &[Value] {
    &self.segments
  }

  pub fn len(&self) -> usize {
    self.segments.len()
  }

  pub fn is_empty(&self) -> bool {
    self.segments.is_empty()
  }

  /// First segment as a string, the conventional "resource" name.
  pub fn root(&self) -> Option<&str> {
    self.segments.first().and_then(Value::as_str)
  }

  /// True when `prefix` matches this key's leading segments.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    prefix.len() <= self.len() && self.segments[..prefix.len()] == prefix.segments[..]
  }

  /// New key with one more segment appended.
  pub fn child(&self, segment: impl Into<Value>) -> Self {
    let mut segments = self.segments.clone();
    segments.push(segment.into());
    Self::new(segments)
  }

  pub fn as_canonical(&self) -> &str {
    &self.canonical
  }
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut fields: Vec<_> = map.iter().collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));
      out.push('{');
      for (i, (name, item)) in fields.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(name.clone()).to_string());
        out.push(':');
        write_canonical(item, out);
      }
      out.push('}');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.canonical)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl From<&str> for QueryKey {
  fn from(root: &str) -> Self {
    Self::new(vec![Value::from(root)])
  }
}

impl From<Vec<Value>> for QueryKey {
  fn from(segments: Vec<Value>) -> Self {
    Self::new(segments)
  }
}

/// Build a [`QueryKey`] from JSON-like segments.
///
/// ```ignore
/// let key = query_key!["courses", {"status": "draft"}];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($segment:tt),* $(,)?) => {
    $crate::cache::QueryKey::new(vec![$(::serde_json::json!($segment)),*])
  };
}

type KeyPredicate = Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>;

/// Selects cache entries for snapshot and invalidation.
#[derive(Clone)]
pub enum KeyFilter {
  /// Exactly this key
  Exact(QueryKey),
  /// Every key starting with these segments
  Prefix(QueryKey),
  /// Arbitrary predicate
  Predicate(KeyPredicate),
}

impl KeyFilter {
  pub fn exact(key: impl Into<QueryKey>) -> Self {
    Self::Exact(key.into())
  }

  pub fn prefix(key: impl Into<QueryKey>) -> Self {
    Self::Prefix(key.into())
  }

  pub fn predicate(f: impl Fn(&QueryKey) -> bool + Send + Sync + 'static) -> Self {
    Self::Predicate(Arc::new(f))
  }

  /// Every key whose first segment equals `root`.
  pub fn root(root: &str) -> Self {
    Self::Prefix(QueryKey::from(root))
  }

  /// Every key in the store.
  pub fn all() -> Self {
    Self::Prefix(QueryKey::new(Vec::new()))
  }

  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      Self::Exact(k) => k == key,
      Self::Prefix(prefix) => key.starts_with(prefix),
      Self::Predicate(f) => f(key),
    }
  }
}

impl From<QueryKey> for KeyFilter {
  fn from(key: QueryKey) -> Self {
    Self::Prefix(key)
  }
}

impl fmt::Debug for KeyFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Exact(k) => write!(f, "Exact({})", k),
      Self::Prefix(k) => write!(f, "Prefix({})", k),
      Self::Predicate(_) => f.write_str("Predicate(..)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use std::collections::HashSet;

  #[test]
  fn test_object_field_order_does_not_matter() {
    let a: QueryKey = serde_json::from_str::<Vec<Value>>(r#"["courses", {"status": "draft", "page": 1}]"#)
      .unwrap()
      .into();
    let b = query_key!["courses", {"page": 1, "status": "draft"}];
    assert_eq!(a, b);

    let mut set = HashSet::new();
    set.insert(a);
    assert!(set.contains(&b));
  }

  #[test]
  fn test_prefix_matching() {
    let key = query_key!["courses", "c1", "chapters"];
    assert!(key.starts_with(&query_key!["courses"]));
    assert!(key.starts_with(&query_key!["courses", "c1"]));
    assert!(!key.starts_with(&query_key!["courses", "c2"]));
    assert!(!query_key!["courses"].starts_with(&key));
  }

  #[test]
  fn test_filters() {
    let key = query_key!["admin-courses", {"status": "draft"}];
    assert!(KeyFilter::root("admin-courses").matches(&key));
    assert!(!KeyFilter::exact(query_key!["admin-courses"]).matches(&key));
    assert!(KeyFilter::all().matches(&key));
    assert!(KeyFilter::predicate(|k| k.len() == 2).matches(&key));
  }

  #[test]
  fn test_child_appends_segment() {
    let key = query_key!["courses"].child("c1");
    assert_eq!(key, query_key!["courses", "c1"]);
    assert_eq!(key.root(), Some("courses"));
  }
}
