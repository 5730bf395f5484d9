//! Remote resources and the URL templates that produce them.

use super::{FetchPolicy, HttpClient, fetch_bytes, retry};
use crate::geo::{self, Granularity};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A file to download. `destination` is derived from `identity` alone, so
/// fetching the same identity twice overwrites the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub identity: String,
    pub url: String,
    pub destination: PathBuf,
}

pub const TIGER_BASE_URL: &str = "https://www2.census.gov/geo/tiger";

/// TIGER/Line block shapefile archive for one state.
pub fn block_shapefile(vintage: u16, state_fips: &str, dir: &Path) -> RemoteResource {
    RemoteResource {
        identity: state_fips.to_string(),
        url: format!(
            "{TIGER_BASE_URL}/TIGER{vintage}/TABBLOCK/tl_{vintage}_{state_fips}_tabblock10.zip"
        ),
        destination: dir.join(format!("{state_fips}_blocks.zip")),
    }
}

/// Block shapefiles for every two-digit code in 01..=56. Unassigned codes are
/// left in; the queue's identity filter is expected to skip them.
pub fn block_shapefiles(vintage: u16, dir: &Path) -> Vec<RemoteResource> {
    geo::state_codes()
        .map(|fips| block_shapefile(vintage, &fips, dir))
        .collect()
}

/// Location of the M-Lab daily histogram statistics in Cloud Storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBucket {
    /// Public object endpoint, `https://storage.googleapis.com` in production.
    pub endpoint: String,
    pub bucket: String,
    /// Object prefix above the granularity directories, e.g. `v0/NA/US`.
    pub prefix: String,
}

impl Default for SampleBucket {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            bucket: "statistics-mlab-sandbox".to_string(),
            prefix: "v0/NA/US".to_string(),
        }
    }
}

impl SampleBucket {
    fn level_prefix(&self, granularity: Granularity) -> String {
        format!("{}/{}/", self.prefix.trim_end_matches('/'), granularity.plural())
    }

    /// Daily histogram statistics of one geography for one year.
    pub fn sample_file(
        &self,
        granularity: Granularity,
        year: u16,
        fips: &str,
        dir: &Path,
    ) -> RemoteResource {
        RemoteResource {
            identity: fips.to_string(),
            url: format!(
                "{}/{}/{}{fips}/{year}/histogram_daily_stats.json",
                self.endpoint,
                self.bucket,
                self.level_prefix(granularity)
            ),
            destination: dir.join(granularity.plural()).join(format!("{fips}.json")),
        }
    }

    pub fn sample_files<'a>(
        &self,
        granularity: Granularity,
        year: u16,
        ids: impl IntoIterator<Item = &'a str>,
        dir: &Path,
    ) -> Vec<RemoteResource> {
        ids.into_iter()
            .map(|fips| self.sample_file(granularity, year, fips, dir))
            .collect()
    }

    fn listing_url(&self, granularity: Granularity, page_token: Option<&str>) -> String {
        let mut url = format!(
            "{}/storage/v1/b/{}/o?delimiter=/&fields=prefixes,nextPageToken&prefix={}",
            self.endpoint,
            self.bucket,
            self.level_prefix(granularity)
        );
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(token);
        }
        url
    }

    /// Lists the geographies that have a directory in the bucket at the given
    /// granularity, following listing pages until exhausted. Each page request
    /// is retried under `policy`.
    #[tracing::instrument(skip(self, client, policy, cancel))]
    pub async fn list_geographies<C: HttpClient + ?Sized>(
        &self,
        client: &C,
        granularity: Granularity,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page_url = self.listing_url(granularity, page_token.as_deref());
            let url = page_url.as_str();
            let body = retry(policy, cancel, move || fetch_bytes(client, url))
                .await
                .with_context(|| format!("listing {}", self.level_prefix(granularity)))?;
            let page = parse_listing(&body, granularity)?;
            debug!(found = page.ids.len(), "Listing page received");
            ids.extend(page.ids);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        info!(count = ids.len(), "Sample geographies listed");
        Ok(ids)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingResponse {
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

/// One page of a bucket listing, reduced to geography identifiers.
#[derive(Debug, PartialEq, Eq)]
pub struct ListingPage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Keeps the listed prefixes whose last segment is an identifier of exactly
/// the granularity's width (`.../counties/06001/` yields `06001`).
pub fn parse_listing(body: &[u8], granularity: Granularity) -> Result<ListingPage> {
    let response: ListingResponse =
        serde_json::from_slice(body).context("decoding bucket listing")?;
    let ids = response
        .prefixes
        .iter()
        .filter_map(|prefix| prefix.trim_end_matches('/').rsplit('/').next())
        .filter(|id| granularity.matches(id))
        .map(str::to_string)
        .collect();
    Ok(ListingPage {
        ids,
        next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
    })
}
