use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{ContentFetcher, FileMetadata, FileStore};
use crate::Result;

/// [`ContentFetcher`] that streams over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher with a 60 second request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Http`](crate::HeddleError::Http) if the TLS backend cannot be
    /// initialised.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(60))
    }

    /// Creates a fetcher with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::Http`](crate::HeddleError::Http) if the TLS backend cannot be
    /// initialised.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    /// Wraps an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn stream_to(&self, url: &str, destination: &Path) -> Result<u64> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        debug!(size = ?response.content_length(), "download size");

        let mut file = tokio::fs::File::create(destination).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.sync_all().await?;
        Ok(downloaded)
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        let guard = PartialDownload::new(destination);
        let bytes = self.stream_to(url, destination).await?;
        guard.keep();
        Ok(bytes)
    }
}

/// Removes a download target when dropped, unless [`keep`](Self::keep)
/// was called.
///
/// Covers errors as well as cancellation: a timed-out, stopped or aborted
/// run drops the download future mid-transfer.
#[derive(Debug)]
struct PartialDownload {
    path: Option<PathBuf>,
}

impl PartialDownload {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
        }
    }
}

/// A file copied from the file store to scratch storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Local path.
    pub path: PathBuf,
    /// Original file name.
    pub filename: String,
    /// Bytes written.
    pub bytes: u64,
}

/// Where `file_id` named `filename` lands inside `scratch_dir`.
///
/// The file id prefix keeps concurrent downloads of equally named files
/// apart; path separators in the name are replaced.
pub fn scratch_path(scratch_dir: &Path, file_id: &str, filename: &str) -> PathBuf {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let safe = match safe.as_str() {
        "" | "." | ".." => "download".to_string(),
        _ => safe,
    };
    scratch_dir.join(format!("{file_id}-{safe}"))
}

/// Resolves `file_id` in the file store and downloads it to scratch.
///
/// # Errors
///
/// Propagates file-store, filesystem and transport errors.
pub async fn fetch_to_scratch(
    files: &dyn FileStore,
    fetcher: &dyn ContentFetcher,
    scratch_dir: &Path,
    file_id: &str,
) -> Result<FetchedFile> {
    let metadata = files.get_file_metadata(file_id).await?;
    fetch_known(files, fetcher, scratch_dir, &metadata).await
}

/// Downloads a file whose metadata has already been looked up.
///
/// # Errors
///
/// Propagates file-store, filesystem and transport errors.
pub async fn fetch_known(
    files: &dyn FileStore,
    fetcher: &dyn ContentFetcher,
    scratch_dir: &Path,
    metadata: &FileMetadata,
) -> Result<FetchedFile> {
    let content = files.get_file_content_url(&metadata.id).await?;

    tokio::fs::create_dir_all(scratch_dir).await?;
    let path = scratch_path(scratch_dir, &metadata.id, &metadata.name);

    info!(url = %content.url, path = %path.display(), "downloading file");
    let bytes = fetcher.download(&content.url, &path).await?;
    info!(bytes, path = %path.display(), "downloaded file");

    Ok(FetchedFile {
        path,
        filename: metadata.name.clone(),
        bytes,
    })
}
