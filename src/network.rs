use hyper::body::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::models::HeaderEntry;

/// HTTP client shared by every probe and elaboration on a worker.
///
/// The request timeout is fleet-wide: changing it swaps the underlying
/// client for all subsequent calls rather than configuring one request.
#[derive(Debug)]
pub struct HttpClient {
    client: RwLock<Arc<reqwest::Client>>,
    timeout_duration: RwLock<Duration>,
    user_agent: String,
    max_content_size: usize,
}

impl HttpClient {
    pub fn new(user_agent: String, timeout_secs: u64) -> Result<Self, FetchError> {
        Self::with_content_limit(user_agent, timeout_secs, Config::MAX_CONTENT_SIZE)
    }

    pub fn with_content_limit(
        user_agent: String,
        timeout_secs: u64,
        max_content_size: usize,
    ) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Self::build_client(&user_agent, timeout)?;
        Ok(Self {
            client: RwLock::new(Arc::new(client)),
            timeout_duration: RwLock::new(timeout),
            user_agent,
            max_content_size,
        })
    }

    fn build_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, FetchError> {
        reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .http1_only()
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(Config::MAX_REDIRECTS))
            // Probed hosts are bare addresses; their certificates never match.
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout_duration.read()
    }

    /// Rebuild the shared client when the timeout actually changes.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), FetchError> {
        if self.timeout() == timeout {
            return Ok(());
        }
        let client = Self::build_client(&self.user_agent, timeout)?;
        *self.client.write() = Arc::new(client);
        *self.timeout_duration.write() = timeout;
        Ok(())
    }

    fn current(&self) -> Arc<reqwest::Client> {
        Arc::clone(&self.client.read())
    }

    /// Single GET, no retries. Non-2xx statuses are errors.
    pub async fn fetch(&self, url: &Url) -> Result<FetchResult, FetchError> {
        let client = self.current();
        let response = client
            .get(url.clone())
            .header("Accept", "text/html,application/xhtml+xml,*/*;q=0.8")
            .send()
            .await
            .map_err(Self::classify_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(length) = response.content_length()
            && length as usize > self.max_content_size
        {
            return Err(FetchError::ContentTooLarge(length as usize, self.max_content_size));
        }

        let final_url = response.url().clone();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::BodyError(e.to_string()))?;

        if body.len() > self.max_content_size {
            return Err(FetchError::ContentTooLarge(body.len(), self.max_content_size));
        }

        Ok(FetchResult {
            final_url,
            status_code: status.as_u16(),
            headers,
            body,
        })
    }

    /// Classify reqwest errors into our FetchError types
    fn classify_error(error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            return FetchError::Timeout;
        }
        if error.is_connect() {
            let msg = error.to_string().to_lowercase();
            if msg.contains("refused") {
                return FetchError::ConnectionRefused;
            }
            if msg.contains("dns") || msg.contains("resolve") {
                return FetchError::DnsError;
            }
        }
        if error.is_redirect() {
            return FetchError::TooManyRedirects;
        }
        let msg = error.to_string().to_lowercase();
        if msg.contains("ssl") || msg.contains("tls") || msg.contains("certificate") {
            return FetchError::SslError;
        }
        FetchError::NetworkError(error.to_string())
    }
}

/// Header pairs with a non-empty first value, in arrival order.
fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<HeaderEntry> {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?.trim();
            if value.is_empty() {
                return None;
            }
            Some(HeaderEntry {
                name: name.as_str().to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// Result of a successful HTTP fetch
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub final_url: Url,
    pub status_code: u16,
    pub headers: Vec<HeaderEntry>,
    pub body: Bytes,
}

impl FetchResult {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors that can occur during HTTP fetching
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection refused - server not accepting connections")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    DnsError,

    #[error("SSL/TLS error - certificate or encryption issue")]
    SslError,

    #[error("Request timeout")]
    Timeout,

    #[error("Too many redirects")]
    TooManyRedirects,

    #[error("Unsuccessful status: {0}")]
    Status(u16),

    #[error("Failed to read response body: {0}")]
    BodyError(String),

    #[error("Content too large: {0} bytes (max: {1} bytes)")]
    ContentTooLarge(usize, usize),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}
