//! Upstream release manifests.
//!
//! An [`UpstreamSource`] reports which versions exist upstream for a
//! category. It is treated as unreliable: the coordinator logs a failed
//! category and moves on.

pub mod wporg;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::{Category, VersionRecord};

pub use wporg::{UpstreamUrls, WordPressOrgSource};

/// Manifest fetch failures. Any of them means the category is skipped for
/// this run.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{category} manifest request failed: {source}")]
    Http {
        category: Category,
        source: reqwest::Error,
    },

    #[error("{category} manifest returned HTTP {status}")]
    Status { category: Category, status: u16 },

    #[error("{category} manifest could not be parsed: {source}")]
    Parse {
        category: Category,
        source: serde_json::Error,
    },
}

/// Source of upstream version manifests.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch the versions currently offered upstream for `category`.
    async fn fetch_manifest(&self, category: Category) -> Result<Vec<VersionRecord>, UpstreamError>;
}
