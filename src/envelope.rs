//! Normalized result envelope and the engine's structured error type.
//!
//! Every network-facing operation produces an [`Envelope`] on success or an
//! [`EngineError`] on failure. The error carries an [`ErrorKind`] that is
//! attached once, at the transport boundary, so the rest of the engine can
//! match on it instead of inspecting message text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The `{success, data, message}` shape every operation resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl<T> Envelope<T> {
  /// Successful envelope carrying data.
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      message: None,
    }
  }

  /// Successful envelope without a payload.
  pub fn ok_empty() -> Self {
    Self {
      success: true,
      data: None,
      message: None,
    }
  }

  /// Failed envelope with a server-provided message.
  pub fn failure(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      message: Some(message.into()),
    }
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  /// Turn a `success: false` envelope into an error. The message is
  /// classified like any failed response, so a version marker still yields
  /// `Conflict`; anything unrecognised is `Rejected`.
  pub fn into_result(self) -> Result<Self, EngineError> {
    if self.success {
      return Ok(self);
    }
    let message = self
      .message
      .unwrap_or_else(|| "The server rejected the request".to_string());
    let mut error = EngineError::from_response(None, None, message);
    if error.kind == ErrorKind::Http {
      error.kind = ErrorKind::Rejected;
    }
    Err(error)
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
    Envelope {
      success: self.success,
      data: self.data.map(f),
      message: self.message,
    }
  }
}

/// Error taxonomy used for retry classification and user-facing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Connection could not be established or was dropped
  Network,
  /// Request exceeded its deadline
  Timeout,
  /// Server asked us to slow down (429)
  RateLimited,
  /// Upstream temporarily unavailable (502/503/504)
  Unavailable,
  /// Input failed server-side validation (400/422)
  Validation,
  /// Resource or payment declined (402)
  Declined,
  /// Not authenticated or not allowed (401/403)
  Permission,
  NotFound,
  /// Version mismatch between our base state and the stored state
  Conflict,
  /// 2xx response whose envelope reported `success: false`
  Rejected,
  /// Any other non-2xx status
  Http,
  /// Response body could not be decoded
  Decode,
  /// Operation abandoned by the caller
  Cancelled,
}

impl ErrorKind {
  /// Classify a failed response. This is the only place message text is
  /// inspected; everything downstream matches on the returned kind.
  pub fn classify(status: Option<u16>, code: Option<&str>, message: &str) -> Self {
    if status == Some(409) {
      return Self::Conflict;
    }
    let lowered = message.to_lowercase();
    if lowered.contains("conflict") || lowered.contains("version") {
      return Self::Conflict;
    }

    match code {
      Some("rate_limit" | "rate_limited") => return Self::RateLimited,
      Some("timeout" | "lock_timeout") => return Self::Timeout,
      Some("api_connection_error") => return Self::Network,
      Some("card_declined" | "insufficient_funds" | "expired_card" | "incorrect_cvc") => {
        return Self::Declined
      }
      Some("validation_error" | "invalid_request") => return Self::Validation,
      _ => {}
    }

    match status {
      Some(408) => Self::Timeout,
      Some(429) => Self::RateLimited,
      Some(502..=504) => Self::Unavailable,
      Some(400 | 422) => Self::Validation,
      Some(401 | 403) => Self::Permission,
      Some(402) => Self::Declined,
      Some(404) => Self::NotFound,
      _ => Self::Http,
    }
  }

  /// Whether this kind is transient by nature.
  pub fn is_transient(self) -> bool {
    matches!(
      self,
      Self::Network | Self::Timeout | Self::RateLimited | Self::Unavailable
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Timeout => "timeout",
      Self::RateLimited => "rate_limited",
      Self::Unavailable => "unavailable",
      Self::Validation => "validation",
      Self::Declined => "declined",
      Self::Permission => "permission",
      Self::NotFound => "not_found",
      Self::Conflict => "conflict",
      Self::Rejected => "rejected",
      Self::Http => "http",
      Self::Decode => "decode",
      Self::Cancelled => "cancelled",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Structured failure produced by transports, mutations and saves.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
  pub kind: ErrorKind,
  pub status: Option<u16>,
  pub code: Option<String>,
  pub message: String,
  /// Server copy of the resource, present on conflicts when the server sends it
  pub conflict_data: Option<Value>,
  pub suggested_action: Option<String>,
}

impl EngineError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      status: None,
      code: None,
      message: message.into(),
      conflict_data: None,
      suggested_action: None,
    }
  }

  /// Build an error from the pieces of a failed response, classifying it.
  pub fn from_response(status: Option<u16>, code: Option<String>, message: impl Into<String>) -> Self {
    let message = message.into();
    let kind = ErrorKind::classify(status, code.as_deref(), &message);
    Self {
      kind,
      status,
      code,
      message,
      conflict_data: None,
      suggested_action: None,
    }
  }

  pub fn conflict(message: impl Into<String>, conflict_data: Option<Value>) -> Self {
    Self {
      status: Some(409),
      conflict_data,
      ..Self::new(ErrorKind::Conflict, message)
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message)
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Network, message)
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = Some(status);
    self
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn with_conflict_data(mut self, data: Value) -> Self {
    self.conflict_data = Some(data);
    self
  }

  pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
    self.suggested_action = Some(action.into());
    self
  }

  pub fn is_conflict(&self) -> bool {
    self.kind == ErrorKind::Conflict
  }

  pub fn is_timeout(&self) -> bool {
    self.kind == ErrorKind::Timeout
  }

  /// Machine-readable code: the server code when present, else the kind.
  pub fn code_or_kind(&self) -> &str {
    self.code.as_deref().unwrap_or(self.kind.as_str())
  }

  /// Message shown to users, with the suggested action appended.
  pub fn user_message(&self) -> String {
    match &self.suggested_action {
      Some(action) if !action.is_empty() => format!("{} {}", self.message, action),
      _ => self.message.clone(),
    }
  }
}

impl From<serde_json::Error> for EngineError {
  fn from(e: serde_json::Error) -> Self {
    Self::new(ErrorKind::Decode, format!("Failed to decode payload: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_409_is_conflict() {
    assert_eq!(ErrorKind::classify(Some(409), None, "nope"), ErrorKind::Conflict);
  }

  #[test]
  fn test_message_markers_are_conflict() {
    assert_eq!(
      ErrorKind::classify(Some(400), None, "Version mismatch on draft"),
      ErrorKind::Conflict
    );
    assert_eq!(
      ErrorKind::classify(None, None, "edit conflict detected"),
      ErrorKind::Conflict
    );
  }

  #[test]
  fn test_status_classification() {
    assert_eq!(ErrorKind::classify(Some(429), None, ""), ErrorKind::RateLimited);
    assert_eq!(ErrorKind::classify(Some(503), None, ""), ErrorKind::Unavailable);
    assert_eq!(ErrorKind::classify(Some(422), None, ""), ErrorKind::Validation);
    assert_eq!(ErrorKind::classify(Some(403), None, ""), ErrorKind::Permission);
    assert_eq!(ErrorKind::classify(Some(418), None, ""), ErrorKind::Http);
  }

  #[test]
  fn test_code_beats_status() {
    assert_eq!(
      ErrorKind::classify(Some(400), Some("card_declined"), "Your card was declined"),
      ErrorKind::Declined
    );
    assert_eq!(
      ErrorKind::classify(Some(400), Some("rate_limit"), "slow down"),
      ErrorKind::RateLimited
    );
  }

  #[test]
  fn test_failed_envelope_becomes_rejected_error() {
    let envelope: Envelope<i32> = Envelope::failure("Title is required");
    let err = envelope.into_result().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Rejected);
    assert_eq!(err.message, "Title is required");
  }

  #[test]
  fn test_failed_envelope_with_version_marker_is_conflict() {
    let envelope: Envelope<()> = Envelope::failure("Version conflict: draft was modified");
    let err = envelope.into_result().unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.status, None);
  }

  #[test]
  fn test_envelope_deserializes_without_data() {
    let envelope: Envelope<Value> = serde_json::from_value(json!({"success": true})).unwrap();
    assert!(envelope.success);
    assert!(envelope.data.is_none());
  }

  #[test]
  fn test_user_message_appends_action() {
    let err = EngineError::network("Request failed.")
      .with_suggested_action("Check your connection and try again.");
    assert_eq!(
      err.user_message(),
      "Request failed. Check your connection and try again."
    );
  }
}
