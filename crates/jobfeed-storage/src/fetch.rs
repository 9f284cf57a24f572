//! Streaming HTTP fetch for remote import feeds.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use futures::TryStreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::io::StreamReader;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// TCP and TLS connection setup only.
    pub connect_timeout: Duration,
    /// From sending the request until the response headers arrive, per attempt.
    /// Body streaming is bounded by the import's own timeout.
    pub response_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_feed_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            response_timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_feed_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no response headers from {url} within {timeout:?}")]
    ResponseTimeout { url: String, timeout: Duration },
}

/// Response body as a byte stream. Holds the concurrency permits until dropped.
pub struct FeedBody {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    _permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
}

impl AsyncRead for FeedBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

pub struct FeedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: FeedBody,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_feed_limit: usize,
    per_feed: Mutex<HashMap<String, Arc<Semaphore>>>,
    response_timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_feed_limit: config.per_feed_concurrency.max(1),
            per_feed: Mutex::new(HashMap::new()),
            response_timeout: config.response_timeout,
            backoff: config.backoff,
        })
    }

    async fn per_feed_semaphore(&self, feed_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_feed.lock().await;
        map.entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_feed_limit)))
            .clone()
    }

    /// Issues the GET with retries, then hands back the body unread. Retries only
    /// happen before any body bytes are consumed.
    pub async fn fetch_stream(
        &self,
        run_id: Uuid,
        feed_id: &str,
        url: &str,
    ) -> Result<FeedResponse, FetchError> {
        // The semaphores live for the fetcher's lifetime and are never closed.
        let global = Arc::clone(&self.global_limit)
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        let feed = self
            .per_feed_semaphore(feed_id)
            .await
            .acquire_owned()
            .await
            .expect("semaphore not closed");

        let span = info_span!("feed_fetch", %run_id, feed_id, url);
        let resp = self.send_with_retries(url).instrument(span).await?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let stream = resp.bytes_stream().map_err(io::Error::other);

        Ok(FeedResponse {
            status,
            final_url,
            content_type,
            body: FeedBody {
                reader: Box::pin(StreamReader::new(stream)),
                _permits: (global, feed),
            },
        })
    }

    async fn send_with_retries(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0;
        loop {
            let sent = tokio::time::timeout(self.response_timeout, self.client.get(url).send()).await;
            match sent {
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(resp),
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    warn!(%status, attempt, "retryable feed status");
                }
                Ok(Err(err)) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable feed request error");
                }
                Err(_elapsed) => {
                    if attempt >= self.backoff.max_retries {
                        return Err(FetchError::ResponseTimeout {
                            url: url.to_string(),
                            timeout: self.response_timeout,
                        });
                    }
                    warn!(attempt, timeout = ?self.response_timeout, "feed response headers timed out");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
