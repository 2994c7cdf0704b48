use thiserror::Error;

/// Failure of a single artifact download. The worker logs it and drops the
/// item; the next sync run re-enqueues it while the file is still missing.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP error downloading {url} (bytes_so_far={bytes_written}): {source}")]
    Http {
        source: reqwest::Error,
        url: String,
        bytes_written: u64,
    },

    #[error("Disk error writing {path}: {source}")]
    Disk {
        source: std::io::Error,
        path: String,
    },
}

impl DownloadError {
    pub(crate) fn disk(path: &std::path::Path, source: std::io::Error) -> Self {
        DownloadError::Disk {
            source,
            path: path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_message() {
        let e = DownloadError::HttpStatus {
            status: 404,
            url: "https://example.test/a.zip".into(),
        };
        assert_eq!(
            e.to_string(),
            "HTTP error 404 downloading https://example.test/a.zip"
        );
    }

    #[test]
    fn test_disk_error_names_path() {
        let e = DownloadError::disk(
            std::path::Path::new("/tmp/x.zip"),
            std::io::Error::other("disk full"),
        );
        assert!(e.to_string().contains("/tmp/x.zip"));
    }

    #[tokio::test]
    async fn test_connection_error_reports_progress() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1")
            .send()
            .await
            .unwrap_err();
        let e = DownloadError::Http {
            source: err,
            url: "http://127.0.0.1:1".into(),
            bytes_written: 42,
        };
        assert!(e.to_string().contains("bytes_so_far=42"));
    }
}
