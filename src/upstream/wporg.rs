//! WordPress.org release APIs.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{UpstreamError, UpstreamSource};
use crate::store::{Category, VersionRecord, CORE_IDENTIFIER};

pub const DEFAULT_CORE_URL: &str = "https://api.wordpress.org/core/version-check/1.7/";
pub const DEFAULT_PLUGINS_URL: &str =
    "https://api.wordpress.org/plugins/info/1.2/?action=query_plugins&request[per_page]=100";
pub const DEFAULT_THEMES_URL: &str =
    "https://api.wordpress.org/themes/info/1.1/?action=query_themes&request[per_page]=100";

/// Metadata kept on each record, per category. Everything else in the
/// upstream entry is dropped.
const CORE_ATTRIBUTES: &[&str] = &[
    "php_version",
    "mysql_version",
    "new_bundled",
    "partial_version",
    "current",
    "locale",
];
const PLUGIN_ATTRIBUTES: &[&str] = &["name", "homepage", "url", "requires", "requires_php", "tested"];
const THEME_ATTRIBUTES: &[&str] = &["name", "homepage", "url", "requires", "requires_php"];

const NO_KEYS: &[&str] = &[];
const PLUGIN_ID_KEYS: &[&str] = &["slug"];
const THEME_ID_KEYS: &[&str] = &["slug", "theme"];
const CORE_URL_KEYS: &[&str] = &["download", "package"];
const LINK_KEYS: &[&str] = &["download_link", "package"];

/// Manifest endpoint per category.
#[derive(Debug, Clone)]
pub struct UpstreamUrls {
    pub core: String,
    pub plugins: String,
    pub themes: String,
}

impl Default for UpstreamUrls {
    fn default() -> Self {
        Self {
            core: DEFAULT_CORE_URL.to_string(),
            plugins: DEFAULT_PLUGINS_URL.to_string(),
            themes: DEFAULT_THEMES_URL.to_string(),
        }
    }
}

impl UpstreamUrls {
    fn for_category(&self, category: Category) -> &str {
        match category {
            Category::Core => &self.core,
            Category::Plugin => &self.plugins,
            Category::Theme => &self.themes,
        }
    }
}

/// [`UpstreamSource`] backed by the public WordPress.org APIs.
#[derive(Debug, Clone)]
pub struct WordPressOrgSource {
    client: Client,
    urls: UpstreamUrls,
}

impl WordPressOrgSource {
    pub fn new(client: Client, urls: UpstreamUrls) -> Self {
        Self { client, urls }
    }
}

#[async_trait]
impl UpstreamSource for WordPressOrgSource {
    async fn fetch_manifest(&self, category: Category) -> Result<Vec<VersionRecord>, UpstreamError> {
        let url = self.urls.for_category(category);
        tracing::debug!(%category, url, "Fetching upstream manifest");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| UpstreamError::Http { category, source })?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                category,
                status: response.status().as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| UpstreamError::Http { category, source })?;

        let records = parse_manifest(category, &body)
            .map_err(|source| UpstreamError::Parse { category, source })?;
        tracing::debug!(%category, count = records.len(), "Parsed upstream manifest");
        Ok(records)
    }
}

/// Upstream lists entries either as an array or as an object keyed by slug.
#[derive(Deserialize)]
#[serde(untagged)]
enum Entries {
    List(Vec<Value>),
    Keyed(Map<String, Value>),
}

impl Default for Entries {
    fn default() -> Self {
        Entries::List(Vec::new())
    }
}

impl Entries {
    fn into_vec(self) -> Vec<Map<String, Value>> {
        match self {
            Entries::List(list) => list
                .into_iter()
                .filter_map(|value| match value {
                    Value::Object(entry) => Some(entry),
                    _ => None,
                })
                .collect(),
            Entries::Keyed(map) => map
                .into_iter()
                .filter_map(|(slug, value)| match value {
                    Value::Object(mut entry) => {
                        entry
                            .entry("slug")
                            .or_insert_with(|| Value::String(slug));
                        Some(entry)
                    }
                    _ => None,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct ManifestBody {
    #[serde(default)]
    offers: Entries,
    #[serde(default)]
    plugins: Entries,
    #[serde(default)]
    themes: Entries,
}

/// Parse one category's manifest body into version records.
///
/// Entries lacking an identifier, version or download URL are skipped.
pub fn parse_manifest(category: Category, body: &str) -> Result<Vec<VersionRecord>, serde_json::Error> {
    let manifest: ManifestBody = serde_json::from_str(body)?;

    let (entries, identifier_keys, url_keys, attribute_keys) = match category {
        Category::Core => (manifest.offers, NO_KEYS, CORE_URL_KEYS, CORE_ATTRIBUTES),
        Category::Plugin => (manifest.plugins, PLUGIN_ID_KEYS, LINK_KEYS, PLUGIN_ATTRIBUTES),
        Category::Theme => (manifest.themes, THEME_ID_KEYS, LINK_KEYS, THEME_ATTRIBUTES),
    };

    let mut records = Vec::new();
    for entry in entries.into_vec() {
        let identifier = match category {
            Category::Core => Some(CORE_IDENTIFIER),
            _ => first_str(&entry, identifier_keys),
        };
        let version = first_str(&entry, &["version", "new_version"]);
        let url = first_str(&entry, url_keys);

        let (Some(identifier), Some(version), Some(url)) = (identifier, version, url) else {
            tracing::debug!(%category, "Skipping manifest entry without identifier, version or URL");
            continue;
        };

        let attributes: Map<String, Value> = attribute_keys
            .iter()
            .filter_map(|key| entry.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();

        records.push(VersionRecord::new(
            category,
            identifier,
            version,
            url,
            Value::Object(attributes),
        ));
    }

    Ok(records)
}

/// First non-empty string among `keys`.
fn first_str<'a>(entry: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| entry.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}
