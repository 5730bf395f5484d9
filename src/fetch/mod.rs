//! Remote resource retrieval.
//!
//! [`HttpClient`] is the transport seam, [`Fetcher`] turns a
//! [`RemoteResource`] into a local file, and [`FetchQueue`] drives many
//! fetches with bounded concurrency and bounded retries.

mod basic;
mod client;
pub mod http;
pub mod queue;
pub mod resource;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use http::{HttpFetcher, StagedFile};
pub use queue::{FetchPolicy, FetchQueue, FetchReport, TaskOutcome, TaskState, retry};
pub use resource::RemoteResource;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Reasons a single fetch attempt can fail. Every variant but `Cancelled` is
/// retryable.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled before completion")]
    Cancelled,
}

/// Materializes a remote resource at its destination path.
///
/// Implementations must overwrite any previous copy so that retries and
/// re-runs are idempotent. Returns the number of bytes written.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, resource: &RemoteResource) -> Result<u64, FetchError>;
}

/// Issues a GET request and returns the whole body, failing on non-2xx status.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Vec<u8>, FetchError> {
    let req = reqwest::Request::new(reqwest::Method::GET, parse_url(url)?);

    let resp = client.execute(req).await?;
    if !resp.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }
    Ok(resp.bytes().await?.to_vec())
}

fn parse_url(url: &str) -> Result<reqwest::Url, FetchError> {
    reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
