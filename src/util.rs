use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest_cookie_store::CookieStoreMutex;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

pub struct HttpClient {
    pub client: ClientWithMiddleware,
    pub cookies: Arc<CookieStoreMutex>,
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Outcome of a single GET. Anything but HTTP 200 is reported as a status
/// value, not an error: whether a 404 matters is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Body(Vec<u8>),
    Status(u16),
}

/// The HTTP primitive every component downloads through.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched, DownloadError>;
}

impl HttpClient {
    /// Builds a client that retries transient failures (connection errors,
    /// 5xx, 408/429) up to `max_retries` times with exponential backoff.
    pub fn new(max_retries: u32) -> reqwest::Result<HttpClient> {
        let cookies = Arc::new(CookieStoreMutex::default());
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client, cookies })
    }
}

#[async_trait]
impl Fetch for HttpClient {
    async fn fetch(&self, url: &str) -> Result<Fetched, DownloadError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Ok(Fetched::Status(status.as_u16()));
        }

        Ok(Fetched::Body(resp.bytes().await?.to_vec()))
    }
}

/// File name a URL would be saved under: the last path component, query
/// string dropped, percent-decoded.
pub fn web_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string())
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if bytes <= 1024.0 {
            break;
        }
        bytes /= 1024.0;
        suffix = next;
    }

    format!("{:.2} {}", bytes, suffix)
}

/// Human readable distance between `t` and now, e.g. "in 5 minutes" or
/// "1 hour, 2 minutes ago".
pub fn format_relative<Tz: TimeZone>(t: &DateTime<Tz>) -> String {
    format_relative_to(t, &Utc::now())
}

fn format_relative_to<Tz: TimeZone>(t: &DateTime<Tz>, now: &DateTime<Utc>) -> String {
    const PERIODS: [(&str, i64); 6] = [
        ("year", 60 * 60 * 24 * 365),
        ("month", 60 * 60 * 24 * 30),
        ("day", 60 * 60 * 24),
        ("hour", 60 * 60),
        ("minute", 60),
        ("second", 1),
    ];

    let delta = t.with_timezone(&Utc).signed_duration_since(*now).num_seconds();
    let in_future = delta > 0;
    let mut seconds = delta.abs();

    let mut parts = Vec::new();
    for (name, length) in PERIODS {
        if seconds >= length {
            let value = seconds / length;
            seconds %= length;
            let plural = if value > 1 { "s" } else { "" };
            parts.push(format!("{} {}{}", value, name, plural));
        }
    }
    if parts.is_empty() {
        return "now".to_string();
    }

    if in_future {
        format!("in {}", parts.join(", "))
    } else {
        format!("{} ago", parts.join(", "))
    }
}
