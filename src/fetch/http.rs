//! HTTP-backed [`Fetcher`] writing through a staging file.

use super::{FetchError, Fetcher, HttpClient, RemoteResource, parse_url};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// Downloads resources over HTTP into their destination path.
pub struct HttpFetcher<C> {
    client: C,
}

impl<C: HttpClient> HttpFetcher<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> Fetcher for HttpFetcher<C> {
    async fn fetch(&self, resource: &RemoteResource) -> Result<u64, FetchError> {
        let req = reqwest::Request::new(reqwest::Method::GET, parse_url(&resource.url)?);
        let mut resp = self.client.execute(req).await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url: resource.url.clone(),
                status: resp.status().as_u16(),
            });
        }

        let mut staged = StagedFile::create(&resource.destination).await?;
        while let Some(chunk) = resp.chunk().await? {
            staged.write(&chunk).await?;
        }
        let written = staged.commit().await?;
        debug!(bytes = written, destination = %resource.destination.display(), "Download stored");
        Ok(written)
    }
}

/// A file written next to its final destination (`<dest>.part`) and renamed
/// over it once complete, so that the destination only ever holds a full copy.
pub struct StagedFile {
    destination: PathBuf,
    staging: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl StagedFile {
    /// Creates (or truncates) the staging file, creating parent directories.
    pub async fn create(destination: &Path) -> std::io::Result<Self> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut staging = destination.as_os_str().to_owned();
        staging.push(".part");
        let staging = PathBuf::from(staging);
        let file = File::create(&staging).await?;
        Ok(Self {
            destination: destination.to_path_buf(),
            staging,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Flushes the staging file and atomically replaces the destination.
    pub async fn commit(mut self) -> std::io::Result<u64> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        drop(self.writer);
        fs::rename(&self.staging, &self.destination).await?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_staged_file_creates_parent_dirs() {
        let dir = temp_dir("broadband_stats_staged_create");
        let dest = dir.join("nested").join("06_blocks.zip");

        let mut staged = StagedFile::create(&dest).await.unwrap();
        staged.write(b"abc").await.unwrap();
        assert_eq!(staged.commit().await.unwrap(), 3);

        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
        assert!(!dir.join("nested").join("06_blocks.zip.part").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_staged_file_overwrites_previous_copy() {
        let dir = temp_dir("broadband_stats_staged_overwrite");
        let dest = dir.join("06001.json");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&dest, b"a much longer stale payload").unwrap();

        for _ in 0..2 {
            let mut staged = StagedFile::create(&dest).await.unwrap();
            staged.write(b"[]").await.unwrap();
            staged.commit().await.unwrap();
        }

        assert_eq!(std::fs::read(&dest).unwrap(), b"[]");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_file_leaves_destination_alone() {
        let dir = temp_dir("broadband_stats_staged_abandon");
        let dest = dir.join("01.zip");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let mut staged = StagedFile::create(&dest).await.unwrap();
        staged.write(b"partial").await.unwrap();
        drop(staged);

        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
