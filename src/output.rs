//! Incremental JSON array output.
//!
//! Aggregates are written as one JSON array per run, one element at a time,
//! so the output never has to fit in memory. [`JsonArrayWriter`] owns the
//! bracket and separator bookkeeping; [`spawn_writer`] puts it behind a
//! channel so that concurrent workers never write to the file directly.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Records buffered between workers and the writer task.
pub const CHANNEL_CAPACITY: usize = 256;

/// Writes `[`, then comma-separated compact JSON values, then `]`.
pub struct JsonArrayWriter<W> {
    inner: W,
    count: usize,
}

impl<W: AsyncWrite + Unpin> JsonArrayWriter<W> {
    /// Writes the opening bracket.
    pub async fn begin(mut inner: W) -> Result<Self> {
        inner.write_all(b"[").await?;
        Ok(Self { inner, count: 0 })
    }

    /// Appends one element, preceded by a comma unless it is the first.
    pub async fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        if self.count > 0 {
            self.inner.write_all(b",").await?;
        }
        self.inner.write_all(b"\n").await?;
        self.inner.write_all(&json).await?;
        self.count += 1;
        Ok(())
    }

    /// Writes the closing bracket, flushes, and hands back the sink.
    pub async fn finish(mut self) -> Result<(W, usize)> {
        self.inner.write_all(b"\n]\n").await?;
        self.inner.flush().await?;
        Ok((self.inner, self.count))
    }
}

/// Creates (truncating) `path` and writes the opening bracket.
pub async fn create_array_file(path: &Path) -> Result<JsonArrayWriter<BufWriter<File>>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = File::create(path)
        .await
        .with_context(|| format!("creating output {}", path.display()))?;
    JsonArrayWriter::begin(BufWriter::new(file)).await
}

/// Moves `writer` into a task that appends every record received on the
/// returned channel. The task closes the array once every sender is dropped
/// and resolves to the number of elements written.
pub fn spawn_writer<W, T>(mut writer: JsonArrayWriter<W>) -> (mpsc::Sender<T>, JoinHandle<Result<usize>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<T>(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            writer.push(&record).await.context("writing output record")?;
        }
        let (_, count) = writer.finish().await.context("closing output array")?;
        debug!(count, "Output array closed");
        Ok(count)
    });
    (tx, handle)
}
