//! Request fingerprints: the (method, normalized URL) identity of a cacheable read.

use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use super::traits::CacheKey;

/// Identity of a request, stable regardless of query-parameter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
  method: Method,
  url: String,
  resource: String,
}

impl RequestFingerprint {
  pub fn new(method: &Method, raw_url: &str) -> Self {
    let (url, resource) = match Url::parse(raw_url.trim()) {
      Ok(parsed) => normalize(parsed),
      Err(_) => {
        // Not a URL we can parse; fall back to the raw string
        let raw = raw_url.trim().to_string();
        let resource = raw.split(['?', '#']).next().unwrap_or_default();
        let resource = trim_slash(resource).to_string();
        (raw, resource)
      }
    };

    Self {
      method: method.clone(),
      url,
      resource,
    }
  }

  pub fn get(raw_url: &str) -> Self {
    Self::new(&Method::GET, raw_url)
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  /// The normalized URL.
  pub fn url(&self) -> &str {
    &self.url
  }

  /// Scheme, authority and path without query: what a write to this URL touches.
  pub fn resource(&self) -> &str {
    &self.resource
  }

  /// Resources whose cached reads a successful write to this URL makes stale:
  /// the resource itself and, for nested paths, its parent collection.
  pub fn affected_resources(&self) -> Vec<String> {
    let mut resources = vec![self.resource.clone()];
    if let Some(parent) = parent_resource(&self.resource) {
      resources.push(parent);
    }
    resources
  }
}

impl fmt::Display for RequestFingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.method, self.url)
  }
}

impl CacheKey for RequestFingerprint {
  fn cache_hash(&self) -> String {
    hash_key(&self.to_string())
  }

  fn description(&self) -> String {
    self.to_string()
  }

  fn resource(&self) -> Option<&str> {
    Some(&self.resource)
  }
}

/// SHA256 hex digest, for stable fixed-length storage keys.
pub(crate) fn hash_key(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Drop the fragment and sort query pairs. Scheme and host case and default
/// ports are already normalized by parsing.
fn normalize(mut url: Url) -> (String, String) {
  url.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();

  if pairs.is_empty() {
    url.set_query(None);
  } else {
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs);
  }

  let mut resource = url.clone();
  resource.set_query(None);
  let resource = trim_slash(resource.as_str()).to_string();

  (url.to_string(), resource)
}

fn trim_slash(s: &str) -> &str {
  let trimmed = s.trim_end_matches('/');
  if trimmed.is_empty() || trimmed.ends_with(':') {
    s
  } else {
    trimmed
  }
}

fn parent_resource(resource: &str) -> Option<String> {
  let path_start = resource
    .find("://")
    .map(|i| i + 3)
    .and_then(|after| resource[after..].find('/').map(|p| after + p))
    .unwrap_or(0);

  let path = &resource[path_start..];
  let segments = path.split('/').filter(|s| !s.is_empty()).count();
  if segments < 2 {
    return None;
  }

  resource
    .rfind('/')
    .filter(|&i| i > path_start)
    .map(|i| resource[..i].to_string())
}
