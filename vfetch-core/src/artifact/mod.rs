//! Artifact naming, finalization and retention sweeping.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const VIDEO_TEMP_SUFFIX: &str = ".video.part";
pub const AUDIO_TEMP_SUFFIX: &str = ".audio.part";
pub const WORKING_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// A completed output on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub quality_label: String,
}

/// All paths one pipeline run touches, derived once from the title so
/// every stage agrees on where temporaries live.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub final_path: PathBuf,
    pub working: PathBuf,
    pub video_temp: PathBuf,
    pub audio_temp: PathBuf,
}

impl ArtifactPaths {
    /// Titles that sanitize to the same stem share paths; the later run
    /// overwrites the earlier one.
    pub fn for_title(dir: &Path, title: &str, extension: &str) -> Self {
        let stem = sanitize_title(title);
        let final_path = dir.join(format!("{stem}.{extension}"));
        Self {
            working: dir.join(format!("{stem}.{extension}{WORKING_SUFFIX}")),
            video_temp: dir.join(format!("{stem}{VIDEO_TEMP_SUFFIX}")),
            audio_temp: dir.join(format!("{stem}{AUDIO_TEMP_SUFFIX}")),
            final_path,
        }
    }

    /// Removes the per-stream temps but leaves the working file alone,
    /// which may hold a finished merge awaiting rename. Failures are
    /// logged and swallowed; a stale temp file never masks the run's
    /// real outcome.
    pub async fn cleanup_stream_temps(&self) {
        for path in [&self.video_temp, &self.audio_temp] {
            remove_quietly(path).await;
        }
    }

    /// Removes every intermediate, the working file included. For
    /// failure paths where nothing on disk is worth keeping.
    pub async fn cleanup_temps(&self) {
        remove_quietly(&self.working).await;
        self.cleanup_stream_temps().await;
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to remove temp file");
        }
    }
}

/// Filesystem-safe stem from a human title. Alphanumerics and a few
/// separators survive; everything else becomes an underscore.
pub fn sanitize_title(title: &str) -> String {
    let mut stem: String = title
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        stem.push_str("untitled");
    }
    stem
}

/// Renames the working file into place and records its size.
pub async fn finalize(
    paths: &ArtifactPaths,
    quality_label: impl Into<String>,
) -> ArtifactResult<Artifact> {
    tokio::fs::rename(&paths.working, &paths.final_path)
        .await
        .map_err(|source| ArtifactError::Io {
            source,
            path: paths.working.clone(),
        })?;
    let metadata =
        tokio::fs::metadata(&paths.final_path)
            .await
            .map_err(|source| ArtifactError::Io {
                source,
                path: paths.final_path.clone(),
            })?;
    Ok(Artifact {
        path: paths.final_path.clone(),
        size_bytes: metadata.len(),
        quality_label: quality_label.into(),
    })
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
}

/// Removes finished artifacts and orphaned temp files older than
/// `max_age`. Per-file failures are counted, not fatal.
pub fn sweep_stale(dir: &Path, max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let now = SystemTime::now();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());
        let Some(age) = age else {
            report.kept += 1;
            continue;
        };
        if age < max_age {
            report.kept += 1;
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(path = %entry.path().display(), "removed stale artifact");
                report.removed += 1;
            }
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "failed to remove stale artifact");
                report.failed += 1;
            }
        }
    }
    report
}
