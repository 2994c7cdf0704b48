use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use super::paths::part_path;

/// Fetches one artifact from `url` into `dest`.
///
/// On success `dest` holds the complete file. On failure `dest` is left as
/// it was.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;
}

/// [`ArtifactFetcher`] that streams the response body into a `.part` file
/// next to the destination and renames it into place when complete.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::disk(parent, e))?;
        }

        let part = part_path(dest);
        let result = attempt_download(&self.client, url, dest, &part).await;
        if result.is_err() {
            // Nothing may be left behind for a failed item.
            let _ = fs::remove_file(&part).await;
        }
        result
    }
}

async fn attempt_download(
    client: &Client,
    url: &str,
    dest: &Path,
    part: &Path,
) -> Result<u64, DownloadError> {
    let response = client.get(url).send().await.map_err(|e| DownloadError::Http {
        source: e,
        url: url.to_string(),
        bytes_written: 0,
    })?;

    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }

    let content_length = response.content_length();

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .await
        .map_err(|e| DownloadError::disk(part, e))?;

    let mut bytes_written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!(
                url,
                ?content_length,
                bytes_written,
                error = %e,
                "Body stream error"
            );
            DownloadError::Http {
                source: e,
                url: url.to_string(),
                bytes_written,
            }
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::disk(part, e))?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| DownloadError::disk(part, e))?;
    drop(file);

    fs::rename(part, dest)
        .await
        .map_err(|e| DownloadError::disk(dest, e))?;

    Ok(bytes_written)
}
