//! Bounded exponential backoff for operations that fail transiently.
//!
//! The controller attempts an operation, classifies each failure as
//! retryable or terminal, and sleeps `min(max_delay, base_delay × multiplier^attempt)`
//! between attempts. It never touches the cache, so multi-step flows can use
//! it on their own.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::envelope::{EngineError, ErrorKind};

/// Backoff parameters for one operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  /// Retries after the first attempt; total attempts are `max_retries + 1`
  pub max_retries: u32,
  pub base_delay: Duration,
  pub multiplier: f64,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      multiplier: 2.0,
      max_delay: Duration::from_millis(30_000),
    }
  }
}

impl RetryPolicy {
  /// Same delay before every retry.
  pub fn fixed(retries: u32, delay: Duration) -> Self {
    Self {
      max_retries: retries,
      base_delay: delay,
      multiplier: 1.0,
      max_delay: delay,
    }
  }

  /// No retries at all.
  pub fn none() -> Self {
    Self::fixed(0, Duration::ZERO)
  }

  /// Delay to wait after the failed attempt with the given 0-based index.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = self.multiplier.max(0.0).powi(attempt.min(i32::MAX as u32) as i32);
    let millis = self.base_delay.as_millis() as f64 * factor;
    let capped = millis.min(self.max_delay.as_millis() as f64);
    if capped.is_finite() && capped > 0.0 {
      Duration::from_millis(capped.round() as u64)
    } else if capped.is_finite() {
      Duration::ZERO
    } else {
      self.max_delay
    }
  }
}

/// Decides which failures deserve another attempt.
pub trait RetryClassifier: Send + Sync {
  fn is_retryable(&self, error: &EngineError) -> bool;

  /// Human-actionable hint attached to the terminal error.
  fn suggested_action(&self, error: &EngineError) -> String {
    default_suggested_action(error)
  }
}

/// Static code table with a per-kind fallback.
///
/// Codes listed as terminal win over a transient kind, so a `card_declined`
/// reported with a 503 is still not retried.
#[derive(Debug, Clone)]
pub struct CodeTable {
  retryable: HashSet<String>,
  terminal: HashSet<String>,
}

const RETRYABLE_CODES: &[&str] = &[
  "rate_limit",
  "rate_limited",
  "lock_timeout",
  "api_connection_error",
  "processing_error",
  "timeout",
  "service_unavailable",
];

const TERMINAL_CODES: &[&str] = &[
  "card_declined",
  "insufficient_funds",
  "expired_card",
  "incorrect_cvc",
  "invalid_request",
  "validation_error",
];

impl Default for CodeTable {
  fn default() -> Self {
    Self {
      retryable: RETRYABLE_CODES.iter().map(|c| c.to_string()).collect(),
      terminal: TERMINAL_CODES.iter().map(|c| c.to_string()).collect(),
    }
  }
}

impl CodeTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_retryable(mut self, code: impl Into<String>) -> Self {
    let code = code.into();
    self.terminal.remove(&code);
    self.retryable.insert(code);
    self
  }

  pub fn with_terminal(mut self, code: impl Into<String>) -> Self {
    let code = code.into();
    self.retryable.remove(&code);
    self.terminal.insert(code);
    self
  }
}

impl RetryClassifier for CodeTable {
  fn is_retryable(&self, error: &EngineError) -> bool {
    if error.kind == ErrorKind::Conflict {
      return false;
    }
    if let Some(code) = error.code.as_deref() {
      if self.terminal.contains(code) {
        return false;
      }
      if self.retryable.contains(code) {
        return true;
      }
    }
    error.kind.is_transient()
  }
}

/// Retries timeouts only. Used for explicit saves, which must never retry a
/// conflict or a validation failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutOnly;

impl RetryClassifier for TimeoutOnly {
  fn is_retryable(&self, error: &EngineError) -> bool {
    error.is_timeout()
  }
}

fn default_suggested_action(error: &EngineError) -> String {
  match error.code.as_deref() {
    Some("card_declined") | Some("expired_card") | Some("incorrect_cvc") => {
      return "Use a different payment method.".to_string()
    }
    Some("insufficient_funds") => return "Use a different card or add funds.".to_string(),
    _ => {}
  }

  match error.kind {
    ErrorKind::Network | ErrorKind::Timeout => "Check your connection and try again.",
    ErrorKind::RateLimited => "Wait a moment and try again.",
    ErrorKind::Unavailable => "The service is temporarily unavailable. Try again shortly.",
    ErrorKind::Validation | ErrorKind::Rejected => "Review your input and try again.",
    ErrorKind::Declined => "Use a different payment method.",
    ErrorKind::Permission => "Sign in again or ask for access.",
    ErrorKind::NotFound => "Refresh the page; the item may have been removed.",
    ErrorKind::Conflict => "Reload to see the latest version, or keep your changes.",
    ErrorKind::Http | ErrorKind::Decode => "Try again later.",
    ErrorKind::Cancelled => "",
  }
  .to_string()
}

/// What the caller wants after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  Retry,
  Abort,
}

/// Normalized failure returned once retrying is over.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TerminalError {
  pub code: String,
  pub message: String,
  /// Always false: the controller already gave up
  pub retryable: bool,
  pub suggested_action: String,
  /// Attempts made, including the first one
  pub attempts: u32,
  pub source: EngineError,
}

impl From<TerminalError> for EngineError {
  fn from(e: TerminalError) -> Self {
    let mut source = e.source;
    if !e.suggested_action.is_empty() {
      source.suggested_action = Some(e.suggested_action);
    }
    source
  }
}

/// Runs operations under a [`RetryPolicy`] and a [`RetryClassifier`].
#[derive(Clone)]
pub struct RetryController {
  policy: RetryPolicy,
  classifier: Arc<dyn RetryClassifier>,
}

impl std::fmt::Debug for RetryController {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RetryController")
      .field("policy", &self.policy)
      .finish_non_exhaustive()
  }
}

impl Default for RetryController {
  fn default() -> Self {
    Self::new(RetryPolicy::default())
  }
}

impl RetryController {
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      policy,
      classifier: Arc::new(CodeTable::default()),
    }
  }

  pub fn with_classifier(mut self, classifier: impl RetryClassifier + 'static) -> Self {
    self.classifier = Arc::new(classifier);
    self
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Run `operation` until it succeeds, fails terminally, exhausts its
  /// retries, or is vetoed.
  pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, TerminalError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
  {
    self
      .execute_with(operation, |_: &EngineError, _: u32| RetryDecision::Retry)
      .await
  }

  /// Like [`execute`](Self::execute), consulting `on_retry` before each
  /// retry so the caller can abort (for example when the user cancels).
  pub async fn execute_with<T, F, Fut, D>(
    &self,
    mut operation: F,
    mut on_retry: D,
  ) -> Result<T, TerminalError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    D: FnMut(&EngineError, u32) -> RetryDecision,
  {
    let mut attempt: u32 = 0;
    loop {
      let error = match operation().await {
        Ok(value) => {
          if attempt > 0 {
            debug!(attempts = attempt + 1, "operation succeeded after retry");
          }
          return Ok(value);
        }
        Err(e) => e,
      };

      let retryable = self.classifier.is_retryable(&error);
      if !retryable || attempt >= self.policy.max_retries {
        warn!(
          attempts = attempt + 1,
          code = error.code_or_kind(),
          retryable,
          "operation failed terminally: {}",
          error.message
        );
        return Err(self.terminal(error, attempt + 1));
      }

      if on_retry(&error, attempt) == RetryDecision::Abort {
        debug!(attempts = attempt + 1, "retry vetoed by caller");
        let cancelled = EngineError {
          kind: ErrorKind::Cancelled,
          ..error
        };
        return Err(self.terminal(cancelled, attempt + 1));
      }

      let delay = self.policy.delay_for(attempt);
      warn!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        code = error.code_or_kind(),
        "retrying after transient failure"
      );
      tokio::time::sleep(delay).await;
      attempt += 1;
    }
  }

  fn terminal(&self, error: EngineError, attempts: u32) -> TerminalError {
    let suggested_action = error
      .suggested_action
      .clone()
      .unwrap_or_else(|| self.classifier.suggested_action(&error));
    TerminalError {
      code: error.code_or_kind().to_string(),
      message: error.message.clone(),
      retryable: false,
      suggested_action,
      attempts,
      source: error,
    }
  }
}

/// Run `operation` with the default code table.
pub async fn execute_with_retry<T, F, Fut>(
  policy: RetryPolicy,
  operation: F,
) -> Result<T, TerminalError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, EngineError>>,
{
  RetryController::new(policy).execute(operation).await
}
