use reqwest::Method;
use url::Url;

use super::TransportError;

/// Media type assumed for a replayed body that carries no `Content-Type`.
pub const DEFAULT_MEDIA_TYPE: &str = "application/json";

/// An outgoing call, fully buffered: method, URL, headers and body.
///
/// The gateway treats this as an opaque tuple and never looks inside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
  pub method: Method,
  pub url: String,
  /// Header name/value pairs in the order they were supplied
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl ApiRequest {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn post(url: impl Into<String>) -> Self {
    Self::new(Method::POST, url)
  }

  pub fn put(url: impl Into<String>) -> Self {
    Self::new(Method::PUT, url)
  }

  pub fn delete(url: impl Into<String>) -> Self {
    Self::new(Method::DELETE, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Attach a JSON body and its content type.
  pub fn with_json<T: serde::Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
    let body = serde_json::to_vec(value)?;
    Ok(
      self
        .with_header("Content-Type", DEFAULT_MEDIA_TYPE)
        .with_body(body),
    )
  }

  /// First value of a header, matched case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("Content-Type")
  }

  pub fn is_read(&self) -> bool {
    self.method == Method::GET
  }
}

/// A response with its body fully read into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
  pub status: u16,
  pub media_type: Option<String>,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ApiResponse {
  pub fn new(status: u16, media_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      media_type: media_type.map(String::from),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A response carrying a JSON body.
  pub fn json(status: u16, body: &str) -> Self {
    Self::new(status, Some(DEFAULT_MEDIA_TYPE), body.as_bytes().to_vec())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  /// Lossy UTF-8 view of the body, for display.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Resolve a possibly relative URL against the configured base.
pub fn resolve_url(base: Option<&Url>, raw: &str) -> Result<Url, TransportError> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => {
      let base = base.ok_or_else(|| {
        TransportError::InvalidUrl(format!("{} is relative and no base URL is configured", raw))
      })?;
      base
        .join(raw)
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", raw, e)))
    }
    Err(e) => Err(TransportError::InvalidUrl(format!("{}: {}", raw, e))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let req = ApiRequest::post("https://api.test/items")
      .with_header("content-type", "text/plain")
      .with_header("X-Trace", "abc");

    assert_eq!(req.content_type(), Some("text/plain"));
    assert_eq!(req.header("x-trace"), Some("abc"));
    assert_eq!(req.header("Authorization"), None);
  }

  #[test]
  fn test_with_json_sets_content_type() {
    let req = ApiRequest::post("/items")
      .with_json(&serde_json::json!({"name": "x"}))
      .unwrap();

    assert_eq!(req.content_type(), Some("application/json"));
    assert_eq!(req.body.as_deref(), Some(br#"{"name":"x"}"#.as_slice()));
  }

  #[test]
  fn test_resolve_relative_url() {
    let base = Url::parse("https://api.test/v1/").unwrap();
    let url = resolve_url(Some(&base), "items/1").unwrap();
    assert_eq!(url.as_str(), "https://api.test/v1/items/1");

    let absolute = resolve_url(Some(&base), "https://other.test/x").unwrap();
    assert_eq!(absolute.as_str(), "https://other.test/x");
  }

  #[test]
  fn test_resolve_relative_url_without_base_fails() {
    let err = resolve_url(None, "/items").unwrap_err();
    assert!(matches!(err, TransportError::InvalidUrl(_)));
  }

  #[test]
  fn test_status_classes() {
    assert!(ApiResponse::json(201, "{}").is_success());
    assert!(ApiResponse::json(404, "{}").is_client_error());
    assert!(!ApiResponse::json(503, "{}").is_success());
  }
}
