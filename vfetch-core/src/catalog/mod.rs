//! Normalization of raw catalog entries into typed renditions, plus the
//! lookup seam the pipeline consumes.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("source access denied: {0}")]
    AccessDenied(String),
    #[error("transient lookup failure: {0}")]
    Transient(String),
}

pub type LookupResult<T> = Result<T, LookupError>;

/// One catalog entry as supplied by the external catalog, before any
/// validation. Field absence is meaningful and mapped explicitly during
/// normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRendition {
    pub id: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub audio_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub approx_duration_ms: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

/// One encoded variant of the source media.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub id: String,
    pub container: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_height: Option<u32>,
    pub audio_bitrate_kbps: Option<u32>,
    pub size_hint: Option<u64>,
    pub url: Option<String>,
}

impl Rendition {
    pub fn fetchable(&self) -> bool {
        self.url.is_some()
    }

    /// An unbounded-length stream cannot be scheduled against a deadline,
    /// so a rendition without a size hint is never selected.
    pub fn schedulable(&self) -> bool {
        self.fetchable() && self.size_hint.is_some()
    }
}

/// Converts raw catalog entries into the internal rendition model.
///
/// Entries with neither video nor audio are invalid and dropped here so
/// the selector never sees them.
pub fn normalize_renditions(raw: Vec<RawRendition>) -> Vec<Rendition> {
    raw.into_iter()
        .filter(|entry| entry.has_video || entry.has_audio)
        .map(|entry| {
            let size_hint = estimate_size(&entry);
            Rendition {
                id: entry.id,
                container: entry.container.unwrap_or_else(|| "mp4".into()),
                has_video: entry.has_video,
                has_audio: entry.has_audio,
                video_height: entry.height,
                audio_bitrate_kbps: entry.audio_bitrate_kbps,
                size_hint,
                url: entry.url,
            }
        })
        .collect()
}

fn estimate_size(entry: &RawRendition) -> Option<u64> {
    if let Some(length) = entry.content_length {
        return Some(length);
    }
    // Duration-derived estimate: kbps * 125 bytes per kbit-second.
    match (entry.approx_duration_ms, entry.audio_bitrate_kbps) {
        (Some(ms), Some(kbps)) => Some(ms / 1000 * u64::from(kbps) * 125),
        (Some(ms), None) => Some(ms),
        _ => None,
    }
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn get_renditions(&self, source_id: &str) -> LookupResult<Vec<RawRendition>>;
}

/// Manifest document served by the catalog for one source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceManifest {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub renditions: Vec<RawRendition>,
}

/// Catalog adapter reading per-source JSON manifests from a directory or
/// an http(s)/file URL prefix.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    root: String,
    client: Client,
}

impl JsonCatalog {
    pub fn new(root: impl Into<String>) -> LookupResult<Self> {
        let client = Client::builder()
            .user_agent("vfetch/0.1")
            .build()
            .map_err(|err| LookupError::Transient(err.to_string()))?;
        Ok(Self {
            root: root.into(),
            client,
        })
    }

    pub async fn manifest(&self, source_id: &str) -> LookupResult<SourceManifest> {
        let contents = self.fetch_manifest_text(source_id).await?;
        serde_json::from_str(&contents)
            .map_err(|err| LookupError::Transient(format!("invalid manifest: {err}")))
    }

    async fn fetch_manifest_text(&self, source_id: &str) -> LookupResult<String> {
        if let Ok(parsed) = Url::parse(&self.root) {
            match parsed.scheme() {
                "file" => {
                    let base = parsed
                        .to_file_path()
                        .map_err(|_| LookupError::Transient("invalid file url".into()))?;
                    return read_manifest_file(base.join(format!("{source_id}.json"))).await;
                }
                "http" | "https" => {
                    let url = format!("{}/{source_id}.json", self.root.trim_end_matches('/'));
                    let response = self
                        .client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|err| LookupError::Transient(err.to_string()))?;
                    return match response.status() {
                        StatusCode::NOT_FOUND | StatusCode::GONE => {
                            Err(LookupError::NotFound(source_id.to_string()))
                        }
                        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                            Err(LookupError::AccessDenied(source_id.to_string()))
                        }
                        status if status.is_success() => response
                            .text()
                            .await
                            .map_err(|err| LookupError::Transient(err.to_string())),
                        status => Err(LookupError::Transient(format!(
                            "catalog returned status {status}"
                        ))),
                    };
                }
                _ => {}
            }
        }
        read_manifest_file(PathBuf::from(&self.root).join(format!("{source_id}.json"))).await
    }
}

async fn read_manifest_file(path: PathBuf) -> LookupResult<String> {
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(LookupError::NotFound(path.display().to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(LookupError::AccessDenied(path.display().to_string()))
        }
        Err(err) => Err(LookupError::Transient(err.to_string())),
    }
}

#[async_trait]
impl CatalogLookup for JsonCatalog {
    async fn get_renditions(&self, source_id: &str) -> LookupResult<Vec<RawRendition>> {
        Ok(self.manifest(source_id).await?.renditions)
    }
}
