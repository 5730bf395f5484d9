use super::AggregateSummary;
use super::utility::{median, ratio};
use crate::geo::Granularity;
use crate::output::{create_array_file, spawn_writer};
use anyhow::{Context, Result, anyhow};
use chrono::{Datelike, NaiveDate};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Download speed bucket floor (Mbit/s) above which audio calls are usable.
pub const AUDIO_THRESHOLD: f64 = 2.5;
/// Download speed bucket floor (Mbit/s) above which video calls are usable.
pub const VIDEO_THRESHOLD: f64 = 10.0;

/// One histogram bucket of one day of measurements.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SampleRecord {
    pub date: String,
    pub bucket_min: f64,
    pub dl_samples_bucket: u64,
    pub ul_samples_bucket: u64,
    #[serde(rename = "download_MED")]
    pub download_med: Option<f64>,
    #[serde(rename = "upload_MED")]
    pub upload_med: Option<f64>,
}

/// Half-year grouping key of a `YYYY-MM...` date: `2016_jan_jun` or
/// `2016_july_dec`. Only the year and month are read; whatever follows the
/// month is ignored. `None` if either does not parse.
pub fn half_year_key(date: &str) -> Option<String> {
    let mut parts = date.trim().split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let month_start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let half = if month_start.month() <= 6 { "jan_jun" } else { "july_dec" };
    Some(format!("{:04}_{half}", month_start.year()))
}

/// Accumulator for the records of one half-year.
#[derive(Debug, Default)]
struct HalfYear {
    dates: HashSet<String>,
    dl_medians: Vec<f64>,
    ul_medians: Vec<f64>,
    total_dl: u64,
    total_ul: u64,
    dl_over_audio: u64,
    dl_over_video: u64,
}

impl HalfYear {
    fn add(&mut self, record: &SampleRecord) {
        self.total_dl += record.dl_samples_bucket;
        self.total_ul += record.ul_samples_bucket;
        if record.bucket_min > AUDIO_THRESHOLD {
            self.dl_over_audio += record.dl_samples_bucket;
        }
        if record.bucket_min > VIDEO_THRESHOLD {
            self.dl_over_video += record.dl_samples_bucket;
        }

        // A day has one row per bucket, all repeating the same daily medians:
        // only the first row of a date feeds the median.
        if !self.dates.insert(record.date.clone()) {
            return;
        }
        self.dl_medians.extend(record.download_med);
        self.ul_medians.extend(record.upload_med);
    }

    fn finish(mut self) -> HalfYearStats {
        HalfYearStats {
            median_dl: median(&mut self.dl_medians),
            median_ul: median(&mut self.ul_medians),
            total_dl_samples: self.total_dl,
            total_ul_samples: self.total_ul,
            percent_over_audio_threshold: ratio(self.dl_over_audio, self.total_dl),
            percent_over_video_threshold: ratio(self.dl_over_video, self.total_dl),
        }
    }
}

/// Statistics of one geography over one half-year.
///
/// Percentages are fractions in `0.0..=1.0`; they are `None` (serialized as
/// `null`) when the period has no download samples.
#[derive(Debug, Clone, PartialEq)]
pub struct HalfYearStats {
    pub median_dl: Option<f64>,
    pub median_ul: Option<f64>,
    pub total_dl_samples: u64,
    pub total_ul_samples: u64,
    pub percent_over_audio_threshold: Option<f64>,
    pub percent_over_video_threshold: Option<f64>,
}

/// Sample statistics for one geography, keyed by half-year.
///
/// Serializes flat: `{"geo_id": .., "2016_jan_jun_median_dl": .., ...}`, with
/// only the half-years present in the source data.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleAggregate {
    pub geo_id: String,
    pub periods: BTreeMap<String, HalfYearStats>,
}

impl SampleAggregate {
    /// Groups `records` by half-year and summarizes each group. Records with
    /// an unparseable date are ignored.
    pub fn from_records(geo_id: String, records: &[SampleRecord]) -> Self {
        let mut groups: BTreeMap<String, HalfYear> = BTreeMap::new();
        for record in records {
            match half_year_key(&record.date) {
                Some(key) => groups.entry(key).or_default().add(record),
                None => debug!(geo_id = %geo_id, date = %record.date, "Ignoring record with bad date"),
            }
        }
        Self {
            geo_id,
            periods: groups.into_iter().map(|(k, g)| (k, g.finish())).collect(),
        }
    }
}

impl Serialize for SampleAggregate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1 + 6 * self.periods.len()))?;
        map.serialize_entry("geo_id", &self.geo_id)?;
        for (key, stats) in &self.periods {
            map.serialize_entry(&format!("{key}_median_dl"), &stats.median_dl)?;
            map.serialize_entry(&format!("{key}_median_ul"), &stats.median_ul)?;
            map.serialize_entry(&format!("{key}_total_dl_samples"), &stats.total_dl_samples)?;
            map.serialize_entry(&format!("{key}_total_ul_samples"), &stats.total_ul_samples)?;
            map.serialize_entry(
                &format!("{key}_percent_over_audio_threshold"),
                &stats.percent_over_audio_threshold,
            )?;
            map.serialize_entry(
                &format!("{key}_percent_over_video_threshold"),
                &stats.percent_over_video_threshold,
            )?;
        }
        map.end()
    }
}

/// Reads one geography's sample file and aggregates it.
pub async fn aggregate_file(geo_id: String, path: &Path) -> Result<SampleAggregate> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let records: Vec<SampleRecord> = serde_json::from_slice(&bytes)
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(SampleAggregate::from_records(geo_id, &records))
}

/// Lists `(geo_id, path)` for every `<digits>.json` file in `dir`.
pub fn sample_files(dir: &Path, granularity: Granularity) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) => {
                files.push((granularity.pad(stem), path.clone()));
            }
            _ => warn!(path = %path.display(), "Skipping file without a numeric geography id"),
        }
    }
    Ok(files)
}

/// Computes a [`SampleAggregate`] for every cached sample file of a
/// granularity (`<dir>/<counties|tracts>/<geo_id>.json`).
pub struct SampleAggregator {
    dir: PathBuf,
    granularity: Granularity,
    concurrency: usize,
}

impl SampleAggregator {
    pub fn new(dir: &Path, granularity: Granularity, concurrency: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            granularity,
            concurrency: concurrency.max(1),
        }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join(self.granularity.plural())
    }

    /// Aggregates every sample file and streams the records into a JSON array
    /// at `output`, at most `concurrency` files at a time.
    #[tracing::instrument(skip(self, output, cancel), fields(granularity = %self.granularity, output = %output.display()))]
    pub async fn run(&self, output: &Path, cancel: CancellationToken) -> Result<AggregateSummary> {
        let files = sample_files(&self.input_dir(), self.granularity)?;
        info!(count = files.len(), "Found sample files");

        let writer = create_array_file(output).await?;
        let (tx, writer_handle) = spawn_writer::<_, SampleAggregate>(writer);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (geo_id, path) in files {
            let span = tracing::info_span!("sample_file", geo_id = %geo_id);
            tasks.spawn(
                process_file(geo_id, path, semaphore.clone(), tx.clone(), cancel.clone())
                    .instrument(span),
            );
        }
        drop(tx);

        let mut summary = AggregateSummary::default();
        let mut writer_closed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(FileOutcome::Written) => summary.geographies += 1,
                Ok(FileOutcome::Failed) => summary.failed += 1,
                Ok(FileOutcome::Cancelled) => summary.cancelled += 1,
                Ok(FileOutcome::WriterClosed) => writer_closed = true,
                Err(e) => {
                    error!(error = %e, "Sample task aborted");
                    summary.failed += 1;
                }
            }
        }

        let written = writer_handle.await.context("joining output writer")??;
        if writer_closed {
            return Err(anyhow!("output writer closed before all records were written"));
        }
        info!(
            geographies = summary.geographies,
            written,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Sample aggregation complete"
        );
        Ok(summary)
    }
}

enum FileOutcome {
    Written,
    Failed,
    Cancelled,
    WriterClosed,
}

async fn process_file(
    geo_id: String,
    path: PathBuf,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<SampleAggregate>,
    cancel: CancellationToken,
) -> FileOutcome {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return FileOutcome::Cancelled,
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return FileOutcome::Cancelled,
        },
    };

    match aggregate_file(geo_id, &path).await {
        Ok(aggregate) => {
            let periods = aggregate.periods.len();
            if tx.send(aggregate).await.is_err() {
                return FileOutcome::WriterClosed;
            }
            info!(periods, path = %path.display(), "Processed");
            FileOutcome::Written
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Skipping sample file");
            FileOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn record(date: &str, bucket_min: f64, dl: u64, ul: u64, dl_med: f64) -> SampleRecord {
        SampleRecord {
            date: date.to_string(),
            bucket_min,
            dl_samples_bucket: dl,
            ul_samples_bucket: ul,
            download_med: Some(dl_med),
            upload_med: Some(dl_med / 10.0),
        }
    }

    #[test]
    fn test_half_year_keys() {
        assert_eq!(half_year_key("2016-03-15").as_deref(), Some("2016_jan_jun"));
        assert_eq!(half_year_key("2016-06-30").as_deref(), Some("2016_jan_jun"));
        assert_eq!(half_year_key("2016-07-01").as_deref(), Some("2016_july_dec"));
        assert_eq!(half_year_key("2016-08-01").as_deref(), Some("2016_july_dec"));
        assert_eq!(half_year_key("2016-13-01"), None);
        assert_eq!(half_year_key("2016-00-10"), None);
        assert_eq!(half_year_key("2016"), None);
        assert_eq!(half_year_key("latest-03-01"), None);
    }

    #[test]
    fn test_half_year_key_ignores_the_day() {
        assert_eq!(half_year_key("2016-02-30").as_deref(), Some("2016_jan_jun"));
        assert_eq!(half_year_key("2016-03").as_deref(), Some("2016_jan_jun"));
        assert_eq!(half_year_key("2016-11-xx").as_deref(), Some("2016_july_dec"));

        let agg = SampleAggregate::from_records(
            "06001".to_string(),
            &[record("2016-02-30", 12.0, 4, 1, 9.0)],
        );
        assert_eq!(agg.periods.len(), 1);
        assert_eq!(agg.periods["2016_jan_jun"].total_dl_samples, 4);
    }

    #[test]
    fn test_median_dedup_by_date_but_counts_accumulate() {
        let records = vec![
            record("2016-03-15", 0.0, 5, 1, 8.0),
            record("2016-03-15", 4.0, 7, 2, 99.0),
        ];
        let agg = SampleAggregate::from_records("06001".to_string(), &records);
        let stats = &agg.periods["2016_jan_jun"];

        assert_eq!(stats.median_dl, Some(8.0));
        assert_eq!(stats.median_ul, Some(0.8));
        assert_eq!(stats.total_dl_samples, 12);
        assert_eq!(stats.total_ul_samples, 3);
        assert_eq!(stats.percent_over_audio_threshold, Some(7.0 / 12.0));
        assert_eq!(stats.percent_over_video_threshold, Some(0.0));
    }

    #[test]
    fn test_thresholds_are_strict_and_cumulative() {
        let records = vec![
            record("2016-01-01", 2.5, 1, 0, 1.0),
            record("2016-01-01", 10.0, 2, 0, 1.0),
            record("2016-01-01", 25.0, 5, 0, 1.0),
        ];
        let agg = SampleAggregate::from_records("06001".to_string(), &records);
        let stats = &agg.periods["2016_jan_jun"];
        assert_eq!(stats.percent_over_audio_threshold, Some(7.0 / 8.0));
        assert_eq!(stats.percent_over_video_threshold, Some(5.0 / 8.0));
    }

    #[test]
    fn test_median_over_distinct_days() {
        let records = vec![
            record("2016-08-01", 0.0, 1, 1, 10.0),
            record("2016-08-02", 0.0, 1, 1, 30.0),
            record("2016-08-03", 0.0, 1, 1, 20.0),
            record("2016-08-04", 0.0, 1, 1, 40.0),
        ];
        let agg = SampleAggregate::from_records("06001".to_string(), &records);
        assert_eq!(agg.periods["2016_july_dec"].median_dl, Some(25.0));
    }

    #[test]
    fn test_no_samples_yields_null_percentages() {
        let records = vec![record("2017-02-01", 50.0, 0, 0, 12.0)];
        let agg = SampleAggregate::from_records("06001".to_string(), &records);
        let json = serde_json::to_value(&agg).unwrap();
        assert_eq!(json["2017_jan_jun_percent_over_audio_threshold"], Value::Null);
        assert_eq!(json["2017_jan_jun_total_dl_samples"], json!(0));
    }

    #[test]
    fn test_serializes_sparse_flat_fields() {
        let records = vec![
            record("2016-03-15", 0.0, 5, 1, 8.0),
            record("2017-09-01", 0.0, 5, 1, 8.0),
        ];
        let agg = SampleAggregate::from_records("06001".to_string(), &records);
        let json = serde_json::to_value(&agg).unwrap();
        let obj = json.as_object().unwrap();

        assert_eq!(obj.len(), 1 + 2 * 6);
        assert_eq!(obj["geo_id"], json!("06001"));
        assert!(obj.contains_key("2016_jan_jun_median_dl"));
        assert!(obj.contains_key("2017_july_dec_percent_over_video_threshold"));
        assert!(!obj.contains_key("2016_july_dec_median_dl"));
    }

    #[test]
    fn test_deserializes_source_field_names() {
        let text = r#"[{"date": "2019-01-01", "bucket_min": 0.0, "bucket_max": 0.5,
            "dl_samples_bucket": 3, "ul_samples_bucket": 4,
            "download_MED": 12.5, "upload_MED": null}]"#;
        let records: Vec<SampleRecord> = serde_json::from_str(text).unwrap();
        assert_eq!(records[0].download_med, Some(12.5));
        assert_eq!(records[0].upload_med, None);
    }
}
