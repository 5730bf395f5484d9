//! Streaming ingestion of the provider availability CSV into the store.
//!
//! Each CSV record goes through [`validate`], which yields a typed
//! [`ConsumerRow`], a "not a consumer row" marker, or a [`RowRejection`].
//! Only valid consumer rows reach the [`StoreWriter`]; rejections are logged
//! and counted, never fatal.

use crate::geo::{self, Granularity};
use crate::store::{ConsumerRow, StoreWriter};
use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONSUMER_COLUMN: &str = "Consumer";
pub const PROVIDER_COLUMN: &str = "Provider ID";
pub const BLOCK_COLUMN: &str = "Census Block FIPS Code";
pub const DOWN_COLUMN: &str = "Max Advertised Downstream Speed (mbps)";
pub const UP_COLUMN: &str = "Max Advertised Upstream Speed (mbps)";

const REQUIRED_COLUMNS: &[&str] = &[
    CONSUMER_COLUMN,
    PROVIDER_COLUMN,
    BLOCK_COLUMN,
    DOWN_COLUMN,
    UP_COLUMN,
];

/// Rows stored between two progress log lines.
const PROGRESS_EVERY: u64 = 100_000;

/// A CSV record as read, before any validation. Fields absent from a short
/// record are `None`.
#[derive(Debug, Default)]
pub struct RawRow {
    pub consumer: Option<String>,
    pub provider_id: Option<String>,
    pub block_code: Option<String>,
    pub max_ad_down: Option<String>,
    pub max_ad_up: Option<String>,
}

/// Positions of the required columns in the header.
#[derive(Debug, Clone, Copy)]
struct Columns {
    consumer: usize,
    provider_id: usize,
    block_code: usize,
    max_ad_down: usize,
    max_ad_up: usize,
}

impl Columns {
    fn locate(headers: &StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|col| find(*col).is_none())
            .collect();
        match (
            find(CONSUMER_COLUMN),
            find(PROVIDER_COLUMN),
            find(BLOCK_COLUMN),
            find(DOWN_COLUMN),
            find(UP_COLUMN),
        ) {
            (Some(consumer), Some(provider_id), Some(block_code), Some(max_ad_down), Some(max_ad_up)) => {
                Ok(Self {
                    consumer,
                    provider_id,
                    block_code,
                    max_ad_down,
                    max_ad_up,
                })
            }
            _ => bail!("CSV header lacks required columns {missing:?}"),
        }
    }

    fn raw_row(&self, record: &StringRecord) -> RawRow {
        let field = |idx: usize| record.get(idx).map(str::to_string);
        RawRow {
            consumer: field(self.consumer),
            provider_id: field(self.provider_id),
            block_code: field(self.block_code),
            max_ad_down: field(self.max_ad_down),
            max_ad_up: field(self.max_ad_up),
        }
    }
}

/// Why a record was not stored.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowRejection {
    #[error("missing value for '{0}'")]
    MissingField(&'static str),
    #[error("'{field}' is not a number: {value:?}")]
    NonNumeric { field: &'static str, value: String },
    #[error("block code {0:?} is not a numeric code of at least 11 digits")]
    InvalidBlockCode(String),
    #[error("unreadable record: {0}")]
    Unreadable(String),
}

/// Truth that a consumer flag marks residential service.
pub fn is_truthy(flag: &str) -> bool {
    let flag = flag.trim();
    flag == "1" || flag.eq_ignore_ascii_case("true")
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RowRejection> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(RowRejection::MissingField(field))
}

fn speed(value: Option<String>, field: &'static str) -> Result<f64, RowRejection> {
    let value = required(value, field)?;
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(RowRejection::NonNumeric { field, value }),
    }
}

/// Validates a raw record.
///
/// `Ok(None)` means the record is well-formed enough to tell that it is not a
/// consumer row, which is a filter decision rather than an error.
pub fn validate(raw: RawRow) -> Result<Option<ConsumerRow>, RowRejection> {
    let consumer = raw.consumer.unwrap_or_default();
    if !is_truthy(&consumer) {
        return Ok(None);
    }

    let provider_id = required(raw.provider_id, PROVIDER_COLUMN)?;
    let block_fips = required(raw.block_code, BLOCK_COLUMN)?;
    if block_fips.len() < Granularity::Tract.width()
        || !block_fips.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(RowRejection::InvalidBlockCode(block_fips));
    }
    let max_ad_down = speed(raw.max_ad_down, DOWN_COLUMN)?;
    let max_ad_up = speed(raw.max_ad_up, UP_COLUMN)?;

    Ok(Some(ConsumerRow {
        tract_fips: geo::tract_fips(&block_fips).to_string(),
        county_fips: geo::county_fips(&block_fips).to_string(),
        block_fips,
        max_ad_down,
        max_ad_up,
        provider_id,
    }))
}

/// Counters for one ingestion run.
///
/// `rows_read == rows_filtered + rows_rejected + rows_stored`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub rows_read: u64,
    pub rows_filtered: u64,
    pub rows_rejected: u64,
    pub rows_stored: u64,
}

/// Streams CSV records from `input` into `writer`, `batch_size` rows per
/// transaction. Does not build indexes.
pub fn ingest_csv<R: Read>(
    input: R,
    writer: &mut StoreWriter,
    batch_size: usize,
) -> Result<IngestSummary> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let columns = Columns::locate(rdr.headers().context("reading CSV header")?)?;

    let batch_size = batch_size.max(1);
    let mut summary = IngestSummary::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut record = StringRecord::new();

    loop {
        let line = rdr.position().line();
        let parsed = match rdr.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => validate(columns.raw_row(&record)),
            Err(e) if e.is_io_error() => return Err(e).context("reading CSV input"),
            Err(e) => Err(RowRejection::Unreadable(e.to_string())),
        };
        summary.rows_read += 1;

        match parsed {
            Ok(Some(row)) => {
                batch.push(row);
                if batch.len() >= batch_size {
                    flush(writer, &mut batch, &mut summary)?;
                }
            }
            Ok(None) => summary.rows_filtered += 1,
            Err(rejection) => {
                summary.rows_rejected += 1;
                debug!(line, reason = %rejection, "Skipping malformed row");
            }
        }
    }
    flush(writer, &mut batch, &mut summary)?;

    if summary.rows_rejected > 0 {
        warn!(rejected = summary.rows_rejected, "Some rows were skipped as malformed");
    }
    Ok(summary)
}

fn flush(
    writer: &mut StoreWriter,
    batch: &mut Vec<ConsumerRow>,
    summary: &mut IngestSummary,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let before = summary.rows_stored;
    writer.insert_batch(batch)?;
    summary.rows_stored += batch.len() as u64;
    batch.clear();
    if before / PROGRESS_EVERY != summary.rows_stored / PROGRESS_EVERY {
        info!(rows = summary.rows_stored, "Stored rows in the database");
    }
    Ok(())
}

/// Loads the CSV at `csv_path` into a new store at `store_path` and indexes it.
///
/// With `overwrite`, an existing store file is removed first; otherwise an
/// existing store is an error.
#[tracing::instrument(skip_all, fields(csv = %csv_path.display(), store = %store_path.display()))]
pub fn ingest_file(
    csv_path: &Path,
    store_path: &Path,
    batch_size: usize,
    overwrite: bool,
) -> Result<IngestSummary> {
    if overwrite && store_path.exists() {
        fs::remove_file(store_path)
            .with_context(|| format!("removing previous store {}", store_path.display()))?;
    }
    let input =
        File::open(csv_path).with_context(|| format!("opening {}", csv_path.display()))?;
    let mut writer = StoreWriter::create(store_path)?;

    info!("Loading rows");
    let summary = ingest_csv(input, &mut writer, batch_size)?;
    info!(rows = summary.rows_stored, "Rows added, creating indexes now");
    writer.finish()?;

    info!(
        read = summary.rows_read,
        stored = summary.rows_stored,
        filtered = summary.rows_filtered,
        rejected = summary.rows_rejected,
        "Store generated"
    );
    Ok(summary)
}
