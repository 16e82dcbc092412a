use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info_span, warn, Instrument};

/// Desktop browsers rotated through on 403 responses.
pub const DEFAULT_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];
pub const DEFAULT_USER_AGENT: &str = DEFAULT_USER_AGENTS[0];
pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const ACCEPT_LANGUAGE_EN: &str = "en-US,en;q=0.5";
pub const MAX_REDIRECTS: usize = 5;

pub fn default_user_agents() -> Vec<String> {
    DEFAULT_USER_AGENTS.iter().map(|agent| agent.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    RotateAgent,
    NonRetryable,
}

/// 403 asks for another user agent, other 4xx are terminal, everything else is retried.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::FORBIDDEN {
        RetryDisposition::RotateAgent
    } else if status.is_client_error() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub server_error_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            server_error_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Total attempts made per fetch; never less than one.
    pub fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub max_redirects: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agents: default_user_agents(),
            max_redirects: MAX_REDIRECTS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserAgentPool {
    agents: Vec<String>,
}

impl UserAgentPool {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut agents: Vec<String> = agents
            .into_iter()
            .map(Into::into)
            .filter(|a| !a.trim().is_empty())
            .collect();
        if agents.is_empty() {
            agents = default_user_agents();
        }
        Self { agents }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, index: usize) -> &str {
        &self.agents[index % self.agents.len()]
    }

    pub fn pick(&self) -> usize {
        fastrand::usize(..self.agents.len())
    }

    /// Index of a different agent whenever the pool has more than one.
    pub fn rotate(&self, current: usize) -> usize {
        let len = self.agents.len();
        if len <= 1 {
            return current;
        }
        (current + 1 + fastrand::usize(..len - 1)) % len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
}

impl RequestHeaders {
    pub fn for_agent(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            accept: ACCEPT_HTML.to_string(),
            accept_language: ACCEPT_LANGUAGE_EN.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// One HTTP GET. Non-success statuses are returned as responses, not errors.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, max_redirects: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(max_redirects))
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl PageTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .header(header::USER_AGENT, &headers.user_agent)
            .header(header::ACCEPT, &headers.accept)
            .header(header::ACCEPT_LANGUAGE, &headers.accept_language)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = if status.is_success() {
            resp.text().await.map_err(classify_reqwest_error)?
        } else {
            String::new()
        };
        Ok(TransportResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("client error {status} for {url}")]
    ClientError { status: u16, url: String },
    #[error("server error {status} for {url}")]
    ServerError { status: u16, url: String },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
}

#[derive(Debug, Error)]
#[error("fetch failed after {attempts} attempt(s): {last}")]
pub struct FetchFailure {
    pub url: String,
    pub attempts: usize,
    #[source]
    pub last: FetchError,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub attempts: usize,
}

impl FetchedPage {
    pub fn was_redirected(&self) -> bool {
        self.final_url != self.url
    }
}

pub struct HttpFetcher {
    transport: Arc<dyn PageTransport>,
    agents: UserAgentPool,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.timeout, config.max_redirects)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            UserAgentPool::new(config.user_agents),
            config.retry,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn PageTransport>,
        agents: UserAgentPool,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            agents,
            policy,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchFailure> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchFailure> {
        let attempts = self.policy.attempts();
        let mut agent = self.agents.pick();
        let mut last = None;

        for attempt in 1..=attempts {
            let headers = RequestHeaders::for_agent(self.agents.get(agent));
            let err = match self.transport.get(url, &headers).await {
                Ok(resp) if resp.status.is_success() => {
                    debug!(attempt, status = resp.status.as_u16(), "fetched");
                    return Ok(FetchedPage {
                        url: url.to_string(),
                        final_url: resp.final_url,
                        body: resp.body,
                        attempts: attempt,
                    });
                }
                Ok(resp) => {
                    let status = resp.status;
                    warn!(attempt, status = status.as_u16(), "http error status");
                    match classify_status(status) {
                        RetryDisposition::NonRetryable => {
                            return Err(FetchFailure {
                                url: url.to_string(),
                                attempts: attempt,
                                last: FetchError::ClientError {
                                    status: status.as_u16(),
                                    url: url.to_string(),
                                },
                            });
                        }
                        RetryDisposition::RotateAgent => {
                            agent = self.agents.rotate(agent);
                            FetchError::ClientError {
                                status: status.as_u16(),
                                url: url.to_string(),
                            }
                        }
                        RetryDisposition::Retryable if status.is_server_error() => {
                            if attempt < attempts {
                                tokio::time::sleep(self.policy.server_error_delay).await;
                            }
                            FetchError::ServerError {
                                status: status.as_u16(),
                                url: url.to_string(),
                            }
                        }
                        RetryDisposition::Retryable => FetchError::Transport {
                            url: url.to_string(),
                            message: format!("unexpected status {status}"),
                        },
                    }
                }
                Err(TransportError::Timeout) => {
                    warn!(attempt, "timeout");
                    FetchError::Timeout {
                        url: url.to_string(),
                    }
                }
                Err(TransportError::Other(message)) => {
                    error!(attempt, error = %message, "transport error");
                    FetchError::Transport {
                        url: url.to_string(),
                        message,
                    }
                }
            };

            last = Some(err);
            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        Err(FetchFailure {
            url: url.to_string(),
            attempts,
            last: last.unwrap_or_else(|| FetchError::Transport {
                url: url.to_string(),
                message: "no attempt made".to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<StatusCode, TransportError>>>,
        otherwise: StatusCode,
        seen_agents: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn always(status: StatusCode) -> Arc<Self> {
            Self::scripted(Vec::new(), status)
        }

        fn scripted(
            script: Vec<Result<StatusCode, TransportError>>,
            otherwise: StatusCode,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                otherwise,
                seen_agents: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen_agents.lock().unwrap().len()
        }

        fn agents(&self) -> Vec<String> {
            self.seen_agents.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageTransport for ScriptedTransport {
        async fn get(
            &self,
            url: &str,
            headers: &RequestHeaders,
        ) -> Result<TransportResponse, TransportError> {
            self.seen_agents
                .lock()
                .unwrap()
                .push(headers.user_agent.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(self.otherwise));
            next.map(|status| TransportResponse {
                status,
                final_url: url.to_string(),
                body: "<html><body>ok</body></html>".to_string(),
            })
        }
    }

    fn no_delay(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::ZERO,
            server_error_delay: Duration::ZERO,
        }
    }

    fn fetcher(transport: Arc<ScriptedTransport>, agents: &[&str]) -> HttpFetcher {
        HttpFetcher::with_transport(
            transport,
            UserAgentPool::new(agents.iter().copied()),
            no_delay(3),
        )
    }

    #[test]
    fn status_classification_matches_policy() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::RotateAgent);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
    }

    #[tokio::test]
    async fn not_found_is_attempted_once() {
        let transport = ScriptedTransport::always(StatusCode::NOT_FOUND);
        let failure = fetcher(transport.clone(), &["ua-a"])
            .fetch("https://broker.example/gone")
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 1);
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.last, FetchError::ClientError { status: 404, .. }));
    }

    #[tokio::test]
    async fn server_error_exhausts_every_attempt() {
        let transport = ScriptedTransport::always(StatusCode::INTERNAL_SERVER_ERROR);
        let failure = fetcher(transport.clone(), &["ua-a"])
            .fetch("https://broker.example/")
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 3);
        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.last, FetchError::ServerError { status: 500, .. }));
    }

    #[tokio::test]
    async fn forbidden_rotates_user_agent_between_attempts() {
        let transport = ScriptedTransport::always(StatusCode::FORBIDDEN);
        let failure = fetcher(transport.clone(), &["ua-a", "ua-b", "ua-c"])
            .fetch("https://broker.example/")
            .await
            .unwrap_err();
        let agents = transport.agents();
        assert_eq!(agents.len(), 3);
        assert!(agents.windows(2).all(|pair| pair[0] != pair[1]));
        assert!(matches!(failure.last, FetchError::ClientError { status: 403, .. }));
    }

    #[tokio::test]
    async fn timeout_then_success_recovers() {
        let transport = ScriptedTransport::scripted(
            vec![Err(TransportError::Timeout), Err(TransportError::Other("reset".into()))],
            StatusCode::OK,
        );
        let page = fetcher(transport.clone(), &["ua-a"])
            .fetch("https://broker.example/")
            .await
            .unwrap();
        assert_eq!(page.attempts, 3);
        assert!(page.body.contains("ok"));
    }

    #[tokio::test]
    async fn zero_retries_still_makes_one_attempt() {
        let transport = ScriptedTransport::always(StatusCode::SERVICE_UNAVAILABLE);
        let fetcher = HttpFetcher::with_transport(
            transport.clone(),
            UserAgentPool::new(["ua-a"]),
            no_delay(0),
        );
        let failure = fetcher.fetch("https://broker.example/").await.unwrap_err();
        assert_eq!(transport.calls(), 1);
        assert_eq!(failure.attempts, 1);
    }

    #[test]
    fn rotation_never_repeats_with_multiple_agents() {
        let pool = UserAgentPool::new(["a", "b"]);
        for _ in 0..50 {
            let start = pool.pick();
            assert_ne!(pool.rotate(start), start);
        }
        let single = UserAgentPool::new(["only"]);
        assert_eq!(single.get(single.rotate(0)), "only");

        let blank = UserAgentPool::new(["", "  "]);
        assert_eq!(blank.len(), DEFAULT_USER_AGENTS.len());
        assert_eq!(blank.get(0), DEFAULT_USER_AGENT);
    }

    #[tokio::test]
    async fn default_pool_rotates_away_from_blocked_agent() {
        let config = HttpClientConfig::default();
        assert!(config.user_agents.len() > 1);

        let transport = ScriptedTransport::always(StatusCode::FORBIDDEN);
        let fetcher = HttpFetcher::with_transport(
            transport.clone(),
            UserAgentPool::new(config.user_agents),
            no_delay(3),
        );
        fetcher.fetch("https://broker.example/").await.unwrap_err();

        let agents = transport.agents();
        assert_eq!(agents.len(), 3);
        assert!(agents.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn redirected_page_keeps_requested_and_final_urls() {
        let page = FetchedPage {
            url: "http://broker.example/".to_string(),
            final_url: "https://www.broker.example/".to_string(),
            body: String::new(),
            attempts: 1,
        };
        assert!(page.was_redirected());
    }
}
