//! Scoped HTTP client shared by the sandbox proxy and the chapter downloader.
//!
//! Every request carries a bounded timeout. Redirects are capped and bodies
//! larger than [`MAX_RESPONSE_BYTES`] are rejected.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum response body size (32 MB).
pub const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request to {url} failed with status {status}")]
    Status { status: u16, url: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("response body too large: {0} bytes (max: {max} bytes)", max = MAX_RESPONSE_BYTES)]
    TooLarge(usize),
}

impl HttpError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HttpError::InvalidUrl(_) | HttpError::TooLarge(_))
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout(e.to_string())
        } else {
            HttpError::Network(e.to_string())
        }
    }
}

/// Text response handed to extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Binary response used for page images.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(15_000),
            user_agent: format!("mangashelf/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("HTTP_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("HTTP_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopedHttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ScopedHttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| HttpError::Network(e.to_string()))?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, HttpError> {
        let parsed = url::Url::parse(url).map_err(|_| HttpError::InvalidUrl(url.to_string()))?;

        let mut req = self.client.get(parsed);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout.min(self.timeout));
        }
        Ok(req.send().await?)
    }

    /// GET returning status, headers and a lossy UTF-8 body. Non-2xx
    /// statuses are returned, not raised, so extensions can inspect them.
    pub async fn get_text(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, HttpError> {
        let resp = self.send(url, headers, timeout).await?;
        let status = resp.status().as_u16();
        let resp_headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = read_limited(resp).await?;
        Ok(HttpResponse {
            status,
            headers: resp_headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    /// GET returning the raw body. Any non-2xx status is an error.
    pub async fn get_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedBody, HttpError> {
        let resp = self.send(url, headers, None).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = read_limited(resp).await?;
        Ok(FetchedBody {
            bytes,
            content_type,
        })
    }
}

async fn read_limited(resp: reqwest::Response) -> Result<Vec<u8>, HttpError> {
    if let Some(len) = resp.content_length() {
        if len as usize > MAX_RESPONSE_BYTES {
            return Err(HttpError::TooLarge(len as usize));
        }
    }
    let body = resp.bytes().await?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Err(HttpError::TooLarge(body.len()));
    }
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> ScopedHttpClient {
        ScopedHttpClient::new(&HttpConfig::default()).unwrap()
    }

    #[test]
    fn test_http_config_default() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(15_000));
        assert!(config.user_agent.starts_with("mangashelf/"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HttpError::Network("reset".into()).is_retryable());
        assert!(HttpError::Status {
            status: 503,
            url: "u".into()
        }
        .is_retryable());
        assert!(!HttpError::InvalidUrl("nope".into()).is_retryable());
        assert!(!HttpError::TooLarge(1).is_retryable());
    }

    #[tokio::test]
    async fn test_get_bytes_returns_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p1.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;

        let body = client()
            .get_bytes(&format!("{}/p1.png", server.uri()), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(body.bytes, vec![1, 2, 3]);
        assert_eq!(body.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_get_bytes_non_success_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client()
            .get_bytes(&format!("{}/missing", server.uri()), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_get_text_forwards_headers_and_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("referer", "https://source.example/"))
            .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("referer".to_string(), "https://source.example/".to_string());
        let resp = client()
            .get_text(&server.uri(), &headers, None)
            .await
            .unwrap();
        assert_eq!(resp.status, 418);
        assert_eq!(resp.body, "teapot");
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = client()
            .get_text("not a url", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidUrl(_)));
    }
}
