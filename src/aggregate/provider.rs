use super::AggregateSummary;
use super::utility::mean;
use crate::geo::Granularity;
use crate::output::{create_array_file, spawn_writer};
use crate::store::{ConsumerRow, StoreReader};
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Provider availability summary for one geography.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAggregate {
    pub geo_id: String,
    pub provider_count: usize,
    pub mean_max_ad_down: f64,
    pub mean_max_ad_up: f64,
    pub source_rows: usize,
}

impl ProviderAggregate {
    /// Summarizes the rows of one geography. No rows yields all zeros.
    pub fn from_rows(geo_id: String, rows: &[ConsumerRow]) -> Self {
        let providers: HashSet<&str> = rows.iter().map(|r| r.provider_id.as_str()).collect();
        let downs: Vec<f64> = rows.iter().map(|r| r.max_ad_down).collect();
        let ups: Vec<f64> = rows.iter().map(|r| r.max_ad_up).collect();

        Self {
            geo_id,
            provider_count: providers.len(),
            mean_max_ad_down: mean(&downs),
            mean_max_ad_up: mean(&ups),
            source_rows: rows.len(),
        }
    }
}

/// Computes a [`ProviderAggregate`] for every geography in the store.
pub struct ProviderAggregator {
    store_path: PathBuf,
    granularity: Granularity,
    concurrency: usize,
}

impl ProviderAggregator {
    pub fn new(store_path: &Path, granularity: Granularity, concurrency: usize) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            granularity,
            concurrency: concurrency.max(1),
        }
    }

    /// Aggregates every distinct geography and streams the records into a JSON
    /// array at `output`.
    ///
    /// Geographies are drained from a shared queue by a fixed pool of blocking
    /// workers, each owning its own read-only connection. Failing to open the
    /// store or the output is fatal; a failed per-geography query is counted.
    #[tracing::instrument(skip(self, output, cancel), fields(granularity = %self.granularity, output = %output.display()))]
    pub async fn run(&self, output: &Path, cancel: CancellationToken) -> Result<AggregateSummary> {
        let store_path = self.store_path.clone();
        let granularity = self.granularity;
        let ids = tokio::task::spawn_blocking(move || {
            StoreReader::open(&store_path)?.distinct_ids(granularity)
        })
        .await
        .context("listing geographies")??;
        info!(count = ids.len(), "Found unique geographies");

        let writer = create_array_file(output).await?;
        let (tx, writer_handle) = spawn_writer::<_, ProviderAggregate>(writer);

        let queue = Arc::new(Mutex::new(ids.into_iter()));
        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let ctx = WorkerContext {
                store_path: self.store_path.clone(),
                granularity,
                queue: queue.clone(),
                tx: tx.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn_blocking(move || ctx.drain(worker));
        }
        drop(tx);

        let mut summary = AggregateSummary::default();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined.map_err(anyhow::Error::from).and_then(|r| r) {
                Ok(tally) => summary.merge(tally),
                Err(e) => {
                    error!(error = %e, "Aggregation worker stopped");
                    first_error.get_or_insert(e);
                }
            }
        }
        summary.cancelled += queue.lock().map(|rest| rest.len()).unwrap_or(0);

        let written = writer_handle.await.context("joining output writer")??;
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(
            geographies = summary.geographies,
            written,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Provider aggregation complete"
        );
        Ok(summary)
    }
}

struct WorkerContext {
    store_path: PathBuf,
    granularity: Granularity,
    queue: Arc<Mutex<std::vec::IntoIter<String>>>,
    tx: mpsc::Sender<ProviderAggregate>,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn next_id(&self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.queue.lock().ok()?.next()
    }

    fn drain(self, worker: usize) -> Result<AggregateSummary> {
        let reader = StoreReader::open(&self.store_path)?;
        let mut tally = AggregateSummary::default();

        while let Some(id) = self.next_id() {
            let rows = match reader.rows_for(self.granularity, &id) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(geo_id = %id, error = %e, "Query failed, skipping geography");
                    tally.failed += 1;
                    continue;
                }
            };
            debug!(worker, geo_id = %id, rows = rows.len(), "Rows analyzed");

            let record = ProviderAggregate::from_rows(self.granularity.pad(&id), &rows);
            self.tx
                .blocking_send(record)
                .map_err(|_| anyhow!("output writer closed"))?;
            tally.geographies += 1;
        }
        Ok(tally)
    }
}
