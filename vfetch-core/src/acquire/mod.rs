//! Acquisition engine: drives one or two concurrent stream fetches with
//! per-job deadlines, writing through a bounded buffer to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::warn;

use crate::catalog::Rendition;
use crate::fetch::{FetchError, StreamFetcher};

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("stream transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream transfer failed: {0}")]
    Stream(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<FetchError> for AcquireError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Io { source, path } => AcquireError::Io { source, path },
            other => AcquireError::Stream(other.to_string()),
        }
    }
}

pub type AcquireResult<T> = Result<T, AcquireError>;

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed(String),
    TimedOut,
}

/// One in-flight retrieval. Mutated only by the engine; consumers see it
/// after it reached `Succeeded`.
#[derive(Debug, Clone)]
pub struct AcquisitionJob {
    pub rendition: Rendition,
    pub destination: PathBuf,
    pub deadline: Instant,
    pub status: JobStatus,
    pub bytes_written: u64,
}

pub struct AcquisitionEngine {
    fetcher: Arc<dyn StreamFetcher>,
    per_stream_timeout: Duration,
    buffer_chunks: usize,
}

impl AcquisitionEngine {
    pub fn new(
        fetcher: Arc<dyn StreamFetcher>,
        per_stream_timeout: Duration,
        buffer_chunks: usize,
    ) -> Self {
        Self {
            fetcher,
            per_stream_timeout,
            buffer_chunks: buffer_chunks.max(1),
        }
    }

    /// Fast path: one rendition streamed straight into `destination`.
    pub async fn acquire_single(
        &self,
        rendition: &Rendition,
        destination: &Path,
    ) -> AcquireResult<AcquisitionJob> {
        self.run_job(rendition, destination).await
    }

    /// Fetches both halves of a dual-stream plan in parallel. The first
    /// job to fail (or time out) cancels its sibling; a dual result
    /// without both halves is useless, so partial files are removed.
    pub async fn acquire_dual(
        &self,
        video: &Rendition,
        video_destination: &Path,
        audio: &Rendition,
        audio_destination: &Path,
    ) -> AcquireResult<(AcquisitionJob, AcquisitionJob)> {
        let result = tokio::try_join!(
            self.run_job(video, video_destination),
            self.run_job(audio, audio_destination),
        );
        match result {
            Ok(jobs) => Ok(jobs),
            Err(error) => {
                remove_partial(video_destination).await;
                remove_partial(audio_destination).await;
                Err(error)
            }
        }
    }

    async fn run_job(
        &self,
        rendition: &Rendition,
        destination: &Path,
    ) -> AcquireResult<AcquisitionJob> {
        let mut job = AcquisitionJob {
            rendition: rendition.clone(),
            destination: destination.to_path_buf(),
            deadline: Instant::now() + self.per_stream_timeout,
            status: JobStatus::Pending,
            bytes_written: 0,
        };
        job.status = JobStatus::InFlight;
        match timeout(self.per_stream_timeout, self.fetch_into(rendition, destination)).await {
            Err(_) => {
                job.status = JobStatus::TimedOut;
                remove_partial(destination).await;
                Err(AcquireError::Timeout(self.per_stream_timeout))
            }
            Ok(Err(error)) => {
                job.status = JobStatus::Failed(error.to_string());
                remove_partial(destination).await;
                Err(error)
            }
            Ok(Ok(bytes_written)) => {
                job.status = JobStatus::Succeeded;
                job.bytes_written = bytes_written;
                Ok(job)
            }
        }
    }

    async fn fetch_into(&self, rendition: &Rendition, destination: &Path) -> AcquireResult<u64> {
        let mut stream = self.fetcher.open_stream(rendition).await?;

        // Bounded buffer between fetch and disk sink. The writer owns the
        // file and removes it itself when the transfer is cut short, so a
        // cancelled fetch never leaves a stray partial behind.
        let (tx, rx) = mpsc::channel::<SinkItem>(self.buffer_chunks);
        let writer = tokio::spawn(write_sink(destination.to_path_buf(), rx));

        let feed = async move {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                // Writer gone means its error carries the cause.
                if tx.send(SinkItem::Chunk(chunk)).await.is_err() {
                    return Ok(());
                }
            }
            let _ = tx.send(SinkItem::Eof).await;
            Ok::<(), AcquireError>(())
        };
        let feed_result = feed.await;

        let writer_result = writer
            .await
            .map_err(|err| AcquireError::Stream(format!("disk writer task failed: {err}")))?;
        feed_result?;
        writer_result
    }
}

enum SinkItem {
    Chunk(Bytes),
    Eof,
}

async fn write_sink(path: PathBuf, mut rx: mpsc::Receiver<SinkItem>) -> AcquireResult<u64> {
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|source| AcquireError::Io {
            source,
            path: path.clone(),
        })?;
    let mut written = 0u64;
    while let Some(item) = rx.recv().await {
        match item {
            SinkItem::Chunk(chunk) => {
                file.write_all(&chunk)
                    .await
                    .map_err(|source| AcquireError::Io {
                        source,
                        path: path.clone(),
                    })?;
                written += chunk.len() as u64;
            }
            SinkItem::Eof => {
                file.flush().await.map_err(|source| AcquireError::Io {
                    source,
                    path: path.clone(),
                })?;
                return Ok(written);
            }
        }
    }
    // Channel closed without EOF: the fetch side errored, timed out or
    // was cancelled. Drop the incomplete file here, where the handle is.
    drop(file);
    remove_partial(&path).await;
    Err(AcquireError::Stream(
        "transfer ended before completion".into(),
    ))
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to remove partial download");
        }
    }
}
