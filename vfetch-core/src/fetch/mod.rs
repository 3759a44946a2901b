//! Byte-stream fetching seam. The pipeline only ever sees the
//! `StreamFetcher` trait; the reqwest implementation lives here so the
//! CLI has something concrete to wire in.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::catalog::Rendition;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rendition {0} has no retrieval locator")]
    NotFetchable(String),
    #[error("failed to open stream: {0}")]
    Open(String),
    #[error("transport error mid-stream: {0}")]
    Transport(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

#[async_trait]
pub trait StreamFetcher: Send + Sync {
    /// Opens the rendition's byte stream. Transport errors after a
    /// successful open are reported through the stream items.
    async fn open_stream(&self, rendition: &Rendition) -> Result<ByteStream, FetchError>;
}

/// Fetcher over reqwest. `file://` locators are served from disk, which
/// keeps tests and local catalogs off the network.
#[derive(Debug, Clone)]
pub struct HttpStreamFetcher {
    client: Client,
}

impl HttpStreamFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent("vfetch/0.1")
            .build()
            .map_err(|err| FetchError::Open(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StreamFetcher for HttpStreamFetcher {
    async fn open_stream(&self, rendition: &Rendition) -> Result<ByteStream, FetchError> {
        let locator = rendition
            .url
            .as_deref()
            .ok_or_else(|| FetchError::NotFetchable(rendition.id.clone()))?;

        if let Ok(parsed) = Url::parse(locator) {
            if parsed.scheme() == "file" {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| FetchError::Open(format!("invalid file url: {locator}")))?;
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|source| FetchError::Io { source, path })?;
                let stream = ReaderStream::new(file)
                    .map(|chunk| chunk.map_err(|err| FetchError::Transport(err.to_string())));
                return Ok(Box::pin(stream));
            }
        }

        let response = self
            .client
            .get(locator)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| FetchError::Open(err.to_string()))?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| FetchError::Transport(err.to_string())));
        Ok(Box::pin(stream))
    }
}
