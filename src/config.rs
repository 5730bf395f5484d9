//! Defaults and environment-driven settings.
//!
//! Command-line flags cover per-run choices; the environment (optionally
//! seeded from a `.env` file) covers deployment details such as where logs go
//! and which bucket serves the sample data.

use crate::fetch::FetchPolicy;
use crate::fetch::resource::SampleBucket;
use crate::geo::Granularity;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOG_FILE: &str = "logs/broadband_stats.log";
pub const DEFAULT_STORE: &str = "fcc-477.sqlite";
pub const DEFAULT_BLOCKS_DIR: &str = "geographies/blocks";
pub const DEFAULT_SAMPLES_DIR: &str = "mlab";
pub const DEFAULT_TIGER_VINTAGE: u16 = 2019;
pub const DEFAULT_SAMPLE_YEAR: u16 = 2019;
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_PROVIDER_CONCURRENCY: usize = 50;
pub const DEFAULT_SAMPLE_CONCURRENCY: usize = 4;
pub const DEFAULT_BLOCK_FETCH_CONCURRENCY: usize = 2;
pub const DEFAULT_SAMPLE_FETCH_CONCURRENCY: usize = 16;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Settings read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `LOG_FILE_PATH`: JSON log file; rotated daily.
    pub log_file_path: PathBuf,
    /// `MLAB_ENDPOINT`, `MLAB_BUCKET`, `MLAB_PREFIX`.
    pub sample_bucket: SampleBucket,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup, falling back to defaults
    /// for absent or empty values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = SampleBucket::default();
        Self {
            log_file_path: get("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            sample_bucket: SampleBucket {
                endpoint: get("MLAB_ENDPOINT")
                    .map(|e| e.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.endpoint),
                bucket: get("MLAB_BUCKET").unwrap_or(defaults.bucket),
                prefix: get("MLAB_PREFIX").unwrap_or(defaults.prefix),
            },
        }
    }
}

/// Fetch policy from the CLI knobs, with the remaining values defaulted.
pub fn fetch_policy(concurrency: usize, max_attempts: u32, timeout_secs: u64) -> FetchPolicy {
    FetchPolicy {
        concurrency: concurrency.max(1),
        max_attempts: max_attempts.max(1),
        task_timeout: Duration::from_secs(timeout_secs.max(1)),
        ..FetchPolicy::default()
    }
}

/// Default provider aggregate output, e.g. `fcc-county.json`.
pub fn provider_output(granularity: Granularity) -> PathBuf {
    PathBuf::from(format!("fcc-{}.json", granularity.singular()))
}

/// Default sample aggregate output, e.g. `mlab-counties.json`.
pub fn sample_output(granularity: Granularity) -> PathBuf {
    PathBuf::from(format!("mlab-{}.json", granularity.plural()))
}
