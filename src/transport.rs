//! HTTP transport that speaks the envelope protocol.
//!
//! This is the only place where responses are classified. Status codes,
//! server error codes and message markers become an [`ErrorKind`] here, so
//! conflicts reach the engine already tagged.

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::envelope::{EngineError, Envelope, ErrorKind};

/// Fields a server may use for its copy of a conflicting resource.
const CONFLICT_FIELDS: &[&str] = &["conflictData", "conflict_data", "current", "data"];

/// JSON-over-HTTP client for envelope-returning endpoints.
#[derive(Clone, Debug)]
pub struct HttpClient {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, EngineError> {
    let mut base_url = Url::parse(base_url).map_err(|e| {
      EngineError::new(
        ErrorKind::Validation,
        format!("Invalid API URL {}: {}", base_url, e),
      )
    })?;
    // Url::join replaces the last segment unless the path ends with a slash
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| EngineError::network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| EngineError::new(ErrorKind::Validation, format!("Invalid path {}: {}", path, e)))
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Envelope<T>, EngineError> {
    self.request::<(), T>(Method::GET, path, None).await
  }

  pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<Envelope<T>, EngineError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    self.request(Method::POST, path, Some(body)).await
  }

  pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<Envelope<T>, EngineError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    self.request(Method::PUT, path, Some(body)).await
  }

  pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<Envelope<T>, EngineError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    self.request(Method::PATCH, path, Some(body)).await
  }

  pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<Envelope<T>, EngineError> {
    self.request::<(), T>(Method::DELETE, path, None).await
  }

  /// Send one request and normalize the outcome.
  pub async fn request<B, T>(
    &self,
    method: Method,
    path: &str,
    body: Option<&B>,
  ) -> Result<Envelope<T>, EngineError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let url = self.endpoint(path)?;
    trace!(%method, %url, "sending request");

    let mut request = self.client.request(method.clone(), url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    let text = response.text().await.map_err(map_reqwest_error)?;
    debug!(%method, path, status = status.as_u16(), "response received");

    if status.is_success() {
      decode_success(status, &text)
    } else {
      Err(error_from_body(status.as_u16(), &text))
    }
  }
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> EngineError {
  if err.is_timeout() {
    EngineError::timeout("The request timed out.")
  } else if err.is_decode() {
    EngineError::new(ErrorKind::Decode, format!("Failed to read response: {}", err))
  } else if err.is_connect() || err.is_request() {
    EngineError::network("Could not reach the server.")
  } else {
    match err.status() {
      Some(status) => EngineError::from_response(Some(status.as_u16()), None, err.to_string()),
      None => EngineError::network(format!("Request failed: {}", err)),
    }
  }
}

/// Decode a 2xx body. Bodies shaped like an envelope are taken as one; any
/// other JSON is treated as the payload of a successful envelope.
pub(crate) fn decode_success<T: DeserializeOwned>(
  status: StatusCode,
  body: &str,
) -> Result<Envelope<T>, EngineError> {
  if body.trim().is_empty() || status == StatusCode::NO_CONTENT {
    return Ok(Envelope::ok_empty());
  }
  let value: Value = serde_json::from_str(body)?;
  let is_envelope = value.get("success").is_some_and(Value::is_boolean);
  if is_envelope {
    Ok(serde_json::from_value(value)?)
  } else {
    Ok(Envelope::ok(serde_json::from_value(value)?))
  }
}

/// Build a classified error from a non-2xx response.
pub(crate) fn error_from_body(status: u16, body: &str) -> EngineError {
  let parsed: Option<Value> = serde_json::from_str(body).ok();

  let text_field = |name: &str| {
    parsed
      .as_ref()
      .and_then(|v| v.get(name))
      .and_then(Value::as_str)
      .map(str::to_string)
  };

  let message = text_field("message")
    .or_else(|| text_field("error"))
    .unwrap_or_else(|| {
      StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Request failed")
        .to_string()
    });
  let code = text_field("code");

  let mut error = EngineError::from_response(Some(status), code, message);
  if error.kind == ErrorKind::Conflict {
    let conflict_data = parsed.as_ref().and_then(|v| {
      CONFLICT_FIELDS
        .iter()
        .find_map(|field| v.get(*field).filter(|d| !d.is_null()).cloned())
    });
    if let Some(data) = conflict_data {
      error = error.with_conflict_data(data);
    }
  }
  error
}
