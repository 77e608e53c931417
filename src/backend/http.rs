use futures::future::BoxFuture;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use std::time::Duration;
use url::Url;

use super::{ApiRequest, ApiResponse, Backend, TransportError, TransportResult};

/// Backend that performs real HTTP calls with reqwest.
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
}

impl HttpBackend {
  pub fn new(timeout: Duration) -> TransportResult<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }

  async fn execute(&self, request: ApiRequest) -> TransportResult<ApiResponse> {
    let url = Url::parse(&request.url)
      .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", request.url, e)))?;

    let mut builder = self.client.request(request.method.clone(), url);
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::InvalidRequest(format!("header {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| TransportError::InvalidRequest(format!("header {}: {}", name, e)))?;
      builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let media_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    // Read the whole body so the caller gets a re-materialized response
    let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

    Ok(ApiResponse {
      status,
      media_type,
      headers,
      body,
    })
  }
}

impl Backend for HttpBackend {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, TransportResult<ApiResponse>> {
    Box::pin(self.execute(request))
  }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_connect() {
    TransportError::Connect(e.to_string())
  } else if e.is_builder() {
    TransportError::InvalidRequest(e.to_string())
  } else {
    TransportError::Io(e.to_string())
  }
}
