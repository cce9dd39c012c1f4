use futures::StreamExt;
use reqwest::redirect::Policy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::util::{discard_file, validate_feed_url, UrlValidationError};

const MAX_REDIRECTS: usize = 5;

/// Errors from fetching a document or downloading a file.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(reqwest::Error),
    /// A redirect hop was refused (too many, loop, or forbidden target)
    #[error("Redirect refused: {0}")]
    Redirect(reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// No data within the configured connect/read timeout
    #[error("Request timed out")]
    Timeout,
    /// Body exceeded the configured size limit
    #[error("Response too large (limit {0} bytes)")]
    TooLarge(u64),
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: u64 },
    /// The cancellation token fired
    #[error("Cancelled")]
    Cancelled,
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LoadError::Timeout
        } else if err.is_redirect() {
            LoadError::Redirect(err)
        } else {
            LoadError::Network(err)
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LoadError::Network(_) | LoadError::Timeout | LoadError::IncompleteResponse { .. } => {
                true
            }
            LoadError::HttpStatus(status) => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// A cancelled token takes precedence over whatever the I/O layer
    /// reported: aborting a socket mid-read surfaces as a network error.
    fn classify(self, token: &CancellationToken) -> Self {
        if token.is_cancelled() {
            LoadError::Cancelled
        } else {
            self
        }
    }
}

/// Reports `(bytes done, bytes total)` only when the whole percentage
/// changes. Bodies without a Content-Length report nothing.
struct PercentProgress<F> {
    emit: F,
    total: Option<u64>,
    last_percent: Option<u64>,
}

impl<F: FnMut(u64, u64)> PercentProgress<F> {
    fn new(emit: F, total: Option<u64>) -> Self {
        Self {
            emit,
            total: total.filter(|t| *t > 0),
            last_percent: None,
        }
    }

    fn update(&mut self, done: u64) {
        let Some(total) = self.total else { return };
        let percent = done.saturating_mul(100) / total;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            (self.emit)(done, total);
        }
    }
}

/// HTTP client for feed documents and enclosures.
///
/// Every call honours a [`CancellationToken`]: network waits race against
/// it and a cancelled token always yields [`LoadError::Cancelled`].
#[derive(Clone)]
pub struct Loader {
    client: reqwest::Client,
    retries: u32,
    max_backoff: Duration,
    max_feed_bytes: u64,
    max_download_bytes: u64,
    allow_private_hosts: bool,
}

impl Loader {
    pub fn from_config(config: &Config) -> Result<Self, LoadError> {
        let client = reqwest::Client::builder()
            .redirect(redirect_policy(config.allow_private_hosts))
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout())
            .read_timeout(config.request_timeout())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(LoadError::Network)?;

        Ok(Self {
            client,
            retries: config.retries,
            max_backoff: config.max_backoff(),
            max_feed_bytes: config.max_feed_bytes,
            max_download_bytes: config.max_download_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// Fetch a document into memory, retrying transient failures.
    pub async fn fetch<F>(
        &self,
        url: &str,
        token: &CancellationToken,
        mut progress: F,
    ) -> Result<Vec<u8>, LoadError>
    where
        F: FnMut(u64, u64) + Send,
    {
        validate_feed_url(url, self.allow_private_hosts)?;

        let mut attempt = 0;
        loop {
            match self.fetch_once(url, token, &mut progress).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    attempt += 1;
                    self.back_off(url, attempt, e.classify(token), token).await?;
                }
            }
        }
    }

    /// Stream a file to `dest`, retrying transient failures.
    ///
    /// Data goes to `<dest>.part` first and is renamed into place once the
    /// body is complete, so `dest` never holds a partial file.
    pub async fn download_to<F>(
        &self,
        url: &str,
        dest: &Path,
        token: &CancellationToken,
        mut progress: F,
    ) -> Result<u64, LoadError>
    where
        F: FnMut(u64, u64) + Send,
    {
        validate_feed_url(url, self.allow_private_hosts)?;

        let part = part_path(dest);
        let mut attempt = 0;
        let result = loop {
            match self.download_once(url, &part, token, &mut progress).await {
                Ok(written) => break Ok(written),
                Err(e) => {
                    attempt += 1;
                    if let Err(e) = self.back_off(url, attempt, e.classify(token), token).await {
                        break Err(e);
                    }
                }
            }
        };

        match result {
            Ok(written) => {
                tokio::fs::rename(&part, dest).await?;
                tracing::debug!(url = %url, dest = %dest.display(), bytes = written, "Download complete");
                Ok(written)
            }
            Err(e) => {
                discard_file(&part).await;
                Err(e)
            }
        }
    }

    /// Sleep before the next attempt, or give up with `err`.
    async fn back_off(
        &self,
        url: &str,
        attempt: u32,
        err: LoadError,
        token: &CancellationToken,
    ) -> Result<(), LoadError> {
        if !err.is_retryable() || attempt > self.retries {
            return Err(err);
        }

        // 1s, 2s, 4s, ... capped
        let delay = Duration::from_secs(1u64 << (attempt - 1).min(16)).min(self.max_backoff);
        tracing::warn!(
            url = %url,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Request failed, retrying after delay"
        );

        tokio::select! {
            _ = token.cancelled() => Err(LoadError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn send(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, LoadError> {
        let response = tokio::select! {
            _ = token.cancelled() => return Err(LoadError::Cancelled),
            response = self.client.get(url).send() => response.map_err(LoadError::from_reqwest)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }

    async fn fetch_once<F>(
        &self,
        url: &str,
        token: &CancellationToken,
        progress: &mut F,
    ) -> Result<Vec<u8>, LoadError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let response = self.send(url, token).await?;
        let expected = response.content_length();
        check_length(expected, self.max_feed_bytes)?;

        let mut progress = PercentProgress::new(progress, expected);
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(LoadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(LoadError::from_reqwest)?;

            if (bytes.len() + chunk.len()) as u64 > self.max_feed_bytes {
                return Err(LoadError::TooLarge(self.max_feed_bytes));
            }
            bytes.extend_from_slice(&chunk);
            progress.update(bytes.len() as u64);
        }

        check_complete(expected, bytes.len() as u64)?;
        Ok(bytes)
    }

    async fn download_once<F>(
        &self,
        url: &str,
        part: &Path,
        token: &CancellationToken,
        progress: &mut F,
    ) -> Result<u64, LoadError>
    where
        F: FnMut(u64, u64) + Send,
    {
        let response = self.send(url, token).await?;
        let expected = response.content_length();
        check_length(expected, self.max_download_bytes)?;

        let mut progress = PercentProgress::new(progress, expected);
        let mut file = tokio::fs::File::create(part).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(LoadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(LoadError::from_reqwest)?;

            written += chunk.len() as u64;
            if written > self.max_download_bytes {
                return Err(LoadError::TooLarge(self.max_download_bytes));
            }
            file.write_all(&chunk).await?;
            progress.update(written);
        }

        check_complete(expected, written)?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn check_length(expected: Option<u64>, limit: u64) -> Result<(), LoadError> {
    match expected {
        Some(len) if len > limit => Err(LoadError::TooLarge(limit)),
        _ => Ok(()),
    }
}

fn check_complete(expected: Option<u64>, received: u64) -> Result<(), LoadError> {
    match expected {
        Some(expected) if received < expected => {
            Err(LoadError::IncompleteResponse { expected, received })
        }
        _ => Ok(()),
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Every hop gets the same URL check as the first request, so a public
/// URL cannot bounce the client onto a private address.
fn redirect_policy(allow_private_hosts: bool) -> Policy {
    Policy::custom(move |attempt| {
        let verdict = check_redirect(attempt.url(), attempt.previous(), allow_private_hosts);
        match verdict {
            Ok(()) => {
                tracing::debug!(
                    to = %attempt.url(),
                    hop = attempt.previous().len() + 1,
                    "Following redirect"
                );
                attempt.follow()
            }
            Err(reason) => {
                tracing::warn!(to = %attempt.url(), reason = %reason, "Redirect refused");
                attempt.error(reason)
            }
        }
    })
}

fn check_redirect(
    next: &reqwest::Url,
    previous: &[reqwest::Url],
    allow_private_hosts: bool,
) -> Result<(), String> {
    if previous.len() >= MAX_REDIRECTS {
        return Err(format!("Too many redirects (max {})", MAX_REDIRECTS));
    }
    if previous.iter().any(|prev| prev.as_str() == next.as_str()) {
        return Err("Redirect loop detected".to_string());
    }
    validate_feed_url(next.as_str(), allow_private_hosts)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{any, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_loader() -> Loader {
        let config = Config {
            max_backoff_secs: 0,
            request_timeout_secs: 5,
            allow_private_hosts: true,
            ..Config::default()
        };
        Loader::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
            .mount(&server)
            .await;

        let bytes = test_loader()
            .fetch(&server.uri(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(bytes, b"<rss/>");
    }

    #[tokio::test]
    async fn test_private_host_rejected_by_default() {
        let server = MockServer::start().await;
        let loader = Loader::from_config(&Config::default()).unwrap();
        let err = loader
            .fetch(&server.uri(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidUrl(_)));
    }

    fn parse_url(s: &str) -> reqwest::Url {
        reqwest::Url::parse(s).unwrap()
    }

    #[test]
    fn test_redirect_to_private_host_refused() {
        let start = [parse_url("https://feeds.example.com/rss")];
        for target in [
            "http://127.0.0.1/admin",
            "http://10.0.0.5/feed",
            "http://192.168.1.1/",
            "http://localhost:8080/",
        ] {
            assert!(
                check_redirect(&parse_url(target), &start, false).is_err(),
                "{} should be refused",
                target
            );
        }
    }

    #[test]
    fn test_redirect_to_private_host_allowed_when_configured() {
        let start = [parse_url("https://feeds.example.com/rss")];
        assert!(check_redirect(&parse_url("http://127.0.0.1/feed"), &start, true).is_ok());
    }

    #[test]
    fn test_redirect_to_public_host_followed() {
        let start = [parse_url("https://feeds.example.com/rss")];
        assert!(check_redirect(&parse_url("https://cdn.example.org/rss"), &start, false).is_ok());
    }

    #[test]
    fn test_redirect_to_other_scheme_refused() {
        let start = [parse_url("https://feeds.example.com/rss")];
        assert!(check_redirect(&parse_url("file:///etc/passwd"), &start, true).is_err());
    }

    #[test]
    fn test_redirect_loop_and_hop_limit() {
        let a = parse_url("https://a.example.com/");
        let b = parse_url("https://b.example.com/");
        assert!(check_redirect(&a, &[a.clone(), b.clone()], false).is_err());

        let chain: Vec<reqwest::Url> = (0..MAX_REDIRECTS)
            .map(|i| parse_url(&format!("https://hop{}.example.com/", i)))
            .collect();
        assert!(check_redirect(&parse_url("https://final.example.com/"), &chain, false).is_err());
    }

    #[tokio::test]
    async fn test_redirect_followed_within_allowed_hosts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", "/new"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let bytes = test_loader()
            .fetch(&format!("{}/old", server.uri()), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(bytes, b"moved");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .mount(&server)
            .await;

        let err = test_loader()
            .fetch(&format!("{}/loop", server.uri()), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Redirect(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_404_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = test_loader()
            .fetch(&server.uri(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(3) // Initial request + 2 retries
            .mount(&server)
            .await;

        let err = test_loader()
            .fetch(&server.uri(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::HttpStatus(500)));
    }

    #[tokio::test]
    async fn test_503_then_success() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let bytes = test_loader()
            .fetch(&server.uri(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(bytes, b"ok");
    }

    #[tokio::test]
    async fn test_body_over_limit_rejected() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 2048]))
            .mount(&server)
            .await;

        let config = Config {
            max_feed_bytes: 1024,
            allow_private_hosts: true,
            ..Config::default()
        };
        let err = Loader::from_config(&config)
            .unwrap()
            .fetch(&server.uri(), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::TooLarge(1024)));
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = test_loader()
            .fetch(&server.uri(), &token, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 10_000]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("42");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let written = test_loader()
            .download_to(&server.uri(), &dest, &CancellationToken::new(), move |done, total| {
                sink.lock().unwrap().push((done, total));
            })
            .await
            .unwrap();

        assert_eq!(written, 10_000);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 10_000);
        assert!(!part_path(&dest).exists());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&(10_000, 10_000)));
        // Never more than one report per percent
        assert!(seen.len() <= 101);
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 100])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("1");
        let token = CancellationToken::new();
        token.cancel();

        let err = test_loader()
            .download_to(&server.uri(), &dest, &token, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_percent_progress_coalesces() {
        let mut calls = Vec::new();
        {
            let mut progress = PercentProgress::new(|d, t| calls.push((d, t)), Some(1000));
            for done in [1, 2, 3, 10, 11, 500, 1000] {
                progress.update(done);
            }
        }
        assert_eq!(calls, vec![(1, 1000), (10, 1000), (500, 1000), (1000, 1000)]);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LoadError::HttpStatus(429).is_retryable());
        assert!(LoadError::HttpStatus(502).is_retryable());
        assert!(LoadError::Timeout.is_retryable());
        assert!(!LoadError::HttpStatus(404).is_retryable());
        assert!(!LoadError::Cancelled.is_retryable());
        assert!(!LoadError::TooLarge(1).is_retryable());
    }

    #[test]
    fn test_cancelled_token_overrides_error() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            LoadError::Timeout.classify(&token),
            LoadError::Cancelled
        ));
    }
}
