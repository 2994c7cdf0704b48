//! Types for the version store and download queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier under which every core release is stored.
pub const CORE_IDENTIFIER: &str = "wordpress";

/// Kind of upstream artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Core,
    Plugin,
    Theme,
}

impl Category {
    /// Every category, in the order a sync run visits them.
    pub const ALL: [Category; 3] = [Category::Core, Category::Plugin, Category::Theme];

    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Plugin => "plugin",
            Self::Theme => "theme",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "core" => Some(Self::Core),
            "plugin" | "plugins" => Some(Self::Plugin),
            "theme" | "themes" => Some(Self::Theme),
            _ => None,
        }
    }

    /// Directory under the artifact root holding this category's archives.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Plugin => "plugins",
            Self::Theme => "themes",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(category, identifier, version)` triple that keys every record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub category: Category,
    pub identifier: String,
    pub version: String,
}

impl VersionKey {
    /// Build a key, pinning core releases to [`CORE_IDENTIFIER`].
    pub fn new(category: Category, identifier: &str, version: &str) -> Self {
        Self {
            category,
            identifier: normalize_identifier(category, identifier),
            version: version.to_string(),
        }
    }
}

impl std::fmt::Display for VersionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.category, self.identifier, self.version)
    }
}

fn normalize_identifier(category: Category, identifier: &str) -> String {
    match category {
        Category::Core => CORE_IDENTIFIER.to_string(),
        Category::Plugin | Category::Theme => identifier.to_string(),
    }
}

/// One known version of one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub category: Category,
    #[serde(default)]
    pub identifier: String,
    pub version: String,
    pub source_url: String,
    /// Category-specific metadata passed through untouched.
    #[serde(default = "empty_attributes")]
    pub attributes: serde_json::Value,
    /// When a worker last persisted this artifact locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

fn empty_attributes() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl VersionRecord {
    /// Create a record that has not been fetched yet.
    pub fn new(
        category: Category,
        identifier: &str,
        version: &str,
        source_url: &str,
        attributes: serde_json::Value,
    ) -> Self {
        Self {
            category,
            identifier: normalize_identifier(category, identifier),
            version: version.to_string(),
            source_url: source_url.to_string(),
            attributes,
            fetched_at: None,
        }
    }

    /// Create a core release record.
    #[cfg(test)]
    pub fn core(version: &str, source_url: &str, attributes: serde_json::Value) -> Self {
        Self::new(Category::Core, CORE_IDENTIFIER, version, source_url, attributes)
    }

    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.category, &self.identifier, &self.version)
    }

    /// Check a record built outside [`VersionRecord::new`], e.g. read from a
    /// seed file, and pin its identifier the way `new` does.
    pub fn validated(mut self) -> Result<Self, InvalidRecord> {
        let empty = |field: &'static str| InvalidRecord::EmptyField {
            category: self.category,
            field,
        };
        if self.category != Category::Core && self.identifier.trim().is_empty() {
            return Err(empty("identifier"));
        }
        if self.version.trim().is_empty() {
            return Err(empty("version"));
        }
        if self.source_url.trim().is_empty() {
            return Err(empty("source_url"));
        }
        self.identifier = normalize_identifier(self.category, &self.identifier);
        Ok(self)
    }
}

/// A record that cannot be stored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRecord {
    #[error("{category} record has an empty {field}")]
    EmptyField {
        category: Category,
        field: &'static str,
    },
}

impl From<&DownloadItem> for VersionRecord {
    fn from(item: &DownloadItem) -> Self {
        Self::new(
            item.category,
            &item.identifier,
            &item.version,
            &item.source_url,
            empty_attributes(),
        )
    }
}

/// Pick the record with the greatest version string.
///
/// Versions compare byte-wise, so `"1.9"` wins over `"1.10"`. Versions of
/// equal segment widths order correctly.
pub fn latest_version<'a, I>(records: I) -> Option<&'a VersionRecord>
where
    I: IntoIterator<Item = &'a VersionRecord>,
{
    records
        .into_iter()
        .max_by(|a, b| a.version.as_str().cmp(b.version.as_str()))
}

/// A unit of download work carried by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub category: Category,
    pub identifier: String,
    pub version: String,
    #[serde(alias = "url")]
    pub source_url: String,
}

impl DownloadItem {
    pub fn key(&self) -> VersionKey {
        VersionKey::new(self.category, &self.identifier, &self.version)
    }
}

impl From<&VersionRecord> for DownloadItem {
    fn from(record: &VersionRecord) -> Self {
        Self {
            category: record.category,
            identifier: record.identifier.clone(),
            version: record.version.clone(),
            source_url: record.source_url.clone(),
        }
    }
}

/// Current holder of a named lease.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Statistics for a single coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunStats {
    /// Upstream versions that were not yet in the store.
    pub versions_discovered: u64,
    /// Download items pushed onto the queue.
    pub items_enqueued: u64,
    /// Categories whose upstream manifest could not be fetched.
    pub categories_failed: u64,
    /// Items dropped because the push failed.
    pub enqueue_failures: u64,
    /// Manifest entries that could not be written to the store.
    pub discovery_failures: u64,
}

/// Summary of the store contents, for the `status` command.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub core_versions: u64,
    pub plugins: u64,
    pub themes: u64,
    pub total_versions: u64,
    pub fetched_versions: u64,
    pub queue_depth: u64,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
}
