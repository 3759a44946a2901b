//! End-to-end orchestration: catalog lookup, selection, acquisition,
//! processing and finalization for one requested output.

mod error;

pub use error::{PipelineError, PipelineResult};

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::acquire::AcquisitionEngine;
use crate::artifact::{self, Artifact, ArtifactPaths};
use crate::catalog::{normalize_renditions, CatalogLookup, LookupError, Rendition};
use crate::config::VfetchConfig;
use crate::process::Coordinator;
use crate::selector::{select, select_dual, OutputKind, OutputRequest, QualityPreference, SelectionPlan};

pub struct Pipeline {
    catalog: Arc<dyn CatalogLookup>,
    engine: AcquisitionEngine,
    coordinator: Coordinator,
    config: VfetchConfig,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn CatalogLookup>,
        engine: AcquisitionEngine,
        coordinator: Coordinator,
        config: VfetchConfig,
    ) -> Self {
        Self {
            catalog,
            engine,
            coordinator,
            config,
        }
    }

    /// Runs the whole pipeline for one source and one requested output.
    /// On every failure path the run's temp files are already gone when
    /// the error is returned.
    pub async fn run(
        &self,
        source_id: &str,
        title: &str,
        request: &OutputRequest,
    ) -> PipelineResult<Artifact> {
        let raw = self.lookup_with_retry(source_id).await?;
        let renditions = normalize_renditions(raw);
        info!(source = source_id, renditions = renditions.len(), "catalog lookup complete");

        let plan = select(&renditions, request);
        let downloads_dir = Path::new(&self.config.paths.downloads_dir).to_path_buf();
        if let Err(source) = tokio::fs::create_dir_all(&downloads_dir).await {
            return Err(PipelineError::Finalize {
                source,
                path: downloads_dir,
            });
        }

        match plan {
            SelectionPlan::NoPlan => Err(PipelineError::PlanNotFound {
                source_id: source_id.to_string(),
            }),
            SelectionPlan::Single(rendition) if request.kind == OutputKind::AudioOnly => {
                self.run_audio_only(&downloads_dir, title, request, &rendition)
                    .await
            }
            SelectionPlan::Single(rendition) => {
                self.run_single(&downloads_dir, title, request, &rendition, &renditions)
                    .await
            }
            SelectionPlan::Dual { video, audio } => {
                self.run_dual(&downloads_dir, title, &video, &audio).await
            }
        }
    }

    async fn lookup_with_retry(
        &self,
        source_id: &str,
    ) -> PipelineResult<Vec<crate::catalog::RawRendition>> {
        let max_attempts = self.config.download.lookup_max_attempts.max(1);
        let backoff = self.config.download.lookup_backoff_seconds;
        let mut last_reason = String::new();
        for attempt in 1..=max_attempts {
            match self.catalog.get_renditions(source_id).await {
                Ok(raw) => return Ok(raw),
                Err(LookupError::NotFound(reason)) => {
                    return Err(PipelineError::SourceUnavailable {
                        source_id: source_id.to_string(),
                        reason,
                    });
                }
                Err(LookupError::AccessDenied(reason)) => {
                    return Err(PipelineError::SourceUnavailable {
                        source_id: source_id.to_string(),
                        reason: format!("access denied: {reason}"),
                    });
                }
                Err(LookupError::Transient(reason)) => {
                    warn!(source = source_id, attempt, error = %reason, "catalog lookup failed");
                    last_reason = reason;
                    if attempt < max_attempts {
                        // Linear backoff: 1x, 2x, 3x the base interval.
                        let wait = std::time::Duration::from_secs(backoff * u64::from(attempt));
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        Err(PipelineError::LookupExhausted {
            source_id: source_id.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    /// Combined rendition on the fast path. If the single fetch fails and
    /// the catalog offers a separate video/audio pair, that pair is tried
    /// once before the failure is surfaced.
    async fn run_single(
        &self,
        dir: &Path,
        title: &str,
        request: &OutputRequest,
        rendition: &Rendition,
        renditions: &[Rendition],
    ) -> PipelineResult<Artifact> {
        let paths = ArtifactPaths::for_title(dir, title, &rendition.container);
        let outcome = self.engine.acquire_single(rendition, &paths.working).await;
        match outcome {
            Ok(_job) => {
                let artifact = finalize_or_cleanup(&paths, video_label(rendition)).await?;
                Ok(artifact)
            }
            Err(error) => {
                paths.cleanup_temps().await;
                match select_dual(renditions, request.quality) {
                    SelectionPlan::Dual { video, audio } => {
                        warn!(
                            rendition = %rendition.id,
                            error = %error,
                            "single-stream fetch failed, falling back to dual-stream plan"
                        );
                        self.run_dual(dir, title, &video, &audio).await
                    }
                    _ => Err(error.into()),
                }
            }
        }
    }

    async fn run_dual(
        &self,
        dir: &Path,
        title: &str,
        video: &Rendition,
        audio: &Rendition,
    ) -> PipelineResult<Artifact> {
        let paths = ArtifactPaths::for_title(dir, title, &video.container);
        let result = self
            .engine
            .acquire_dual(video, &paths.video_temp, audio, &paths.audio_temp)
            .await;
        if let Err(error) = result {
            paths.cleanup_temps().await;
            return Err(error.into());
        }

        let bitrate = audio
            .audio_bitrate_kbps
            .unwrap_or(self.config.transcode.default_audio_bitrate_kbps);
        let merged = self
            .coordinator
            .mux(
                &paths.video_temp,
                &paths.audio_temp,
                &paths.working,
                &video.container,
                bitrate,
                None,
            )
            .await;
        // Stream temps go regardless of how the merge ended; the working
        // file survives only a successful merge.
        match merged {
            Ok(()) => {
                paths.cleanup_stream_temps().await;
                finalize_or_cleanup(&paths, video_label(video)).await
            }
            Err(error) => {
                paths.cleanup_temps().await;
                Err(error.into())
            }
        }
    }

    async fn run_audio_only(
        &self,
        dir: &Path,
        title: &str,
        request: &OutputRequest,
        rendition: &Rendition,
    ) -> PipelineResult<Artifact> {
        let paths = ArtifactPaths::for_title(dir, title, &self.config.transcode.audio_format);
        if let Err(error) = self.engine.acquire_single(rendition, &paths.audio_temp).await {
            paths.cleanup_temps().await;
            return Err(error.into());
        }

        // Non-exact requests re-encode at the configured default, not at
        // whatever bitrate the source happened to declare.
        let bitrate = match request.quality {
            QualityPreference::ExactAudioBitrate(kbps) => kbps,
            _ => self.config.transcode.default_audio_bitrate_kbps,
        };
        let encoded = self
            .coordinator
            .reencode_audio(
                &paths.audio_temp,
                &paths.working,
                &self.config.transcode.audio_format,
                bitrate,
                None,
            )
            .await;
        match encoded {
            Ok(()) => {
                paths.cleanup_stream_temps().await;
                finalize_or_cleanup(&paths, format!("{bitrate}kbps")).await
            }
            Err(error) => {
                paths.cleanup_temps().await;
                Err(error.into())
            }
        }
    }
}

async fn finalize_or_cleanup(
    paths: &ArtifactPaths,
    quality_label: String,
) -> PipelineResult<Artifact> {
    match artifact::finalize(paths, quality_label).await {
        Ok(artifact) => {
            info!(
                path = %artifact.path.display(),
                size = artifact.size_bytes,
                quality = %artifact.quality_label,
                "artifact ready"
            );
            Ok(artifact)
        }
        Err(error) => {
            paths.cleanup_temps().await;
            Err(error.into())
        }
    }
}

fn video_label(rendition: &Rendition) -> String {
    match rendition.video_height {
        Some(height) => format!("{height}p"),
        None => "best".to_string(),
    }
}
