//! End-to-end pipeline runs against a scripted catalog, local media files
//! served over `file://` URLs and a scripted processing engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use vfetch_core::process::{
    EngineProcess, ExitOutcome, ProcessResult, ProcessingEngine, ProcessingSpec,
};
use vfetch_core::{
    AcquisitionEngine, CatalogLookup, Coordinator, HttpStreamFetcher, LookupError, OutputKind,
    OutputRequest, Pipeline, PipelineError, QualityPreference, RawRendition, VfetchConfig,
};

struct ScriptedCatalog {
    renditions: Vec<RawRendition>,
    transient_failures: u32,
    attempts: AtomicU32,
}

impl ScriptedCatalog {
    fn new(renditions: Vec<RawRendition>) -> Self {
        Self {
            renditions,
            transient_failures: 0,
            attempts: AtomicU32::new(0),
        }
    }

    fn always_transient() -> Self {
        Self {
            renditions: Vec::new(),
            transient_failures: u32::MAX,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl CatalogLookup for ScriptedCatalog {
    async fn get_renditions(
        &self,
        _source_id: &str,
    ) -> Result<Vec<RawRendition>, LookupError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.transient_failures {
            return Err(LookupError::Transient("catalog briefly offline".into()));
        }
        Ok(self.renditions.clone())
    }
}

/// Processing engine double: concatenates the input files into the
/// output and records every spec it was handed.
#[derive(Clone, Default)]
struct ConcatEngine {
    specs: Arc<Mutex<Vec<ProcessingSpec>>>,
}

struct DoneProcess {
    progress: watch::Receiver<f32>,
}

#[async_trait]
impl EngineProcess for DoneProcess {
    fn progress(&self) -> watch::Receiver<f32> {
        self.progress.clone()
    }

    async fn wait(&mut self) -> ProcessResult<ExitOutcome> {
        Ok(ExitOutcome {
            success: true,
            code: Some(0),
            detail: String::new(),
        })
    }

    async fn kill(&mut self) -> ProcessResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ProcessingEngine for ConcatEngine {
    async fn spawn(&self, spec: &ProcessingSpec) -> ProcessResult<Box<dyn EngineProcess>> {
        let mut merged = Vec::new();
        for input in &spec.inputs {
            merged.extend(std::fs::read(input).unwrap());
        }
        std::fs::write(&spec.output, merged).unwrap();
        self.specs.lock().unwrap().push(spec.clone());
        let (tx, rx) = watch::channel(0.0f32);
        drop(tx);
        Ok(Box::new(DoneProcess { progress: rx }))
    }
}

fn raw_rendition(id: &str) -> RawRendition {
    RawRendition {
        id: id.to_string(),
        container: Some("mp4".into()),
        has_video: false,
        has_audio: false,
        height: None,
        audio_bitrate_kbps: None,
        content_length: None,
        approx_duration_ms: None,
        url: None,
    }
}

fn media_file(dir: &Path, name: &str, contents: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    format!("file://{}", path.display())
}

fn combined(dir: &Path, id: &str, height: u32, contents: &[u8]) -> RawRendition {
    let mut r = raw_rendition(id);
    r.has_video = true;
    r.has_audio = true;
    r.height = Some(height);
    r.content_length = Some(contents.len() as u64);
    r.url = Some(media_file(dir, &format!("{id}.bin"), contents));
    r
}

fn video_only(dir: &Path, id: &str, height: u32, contents: &[u8]) -> RawRendition {
    let mut r = raw_rendition(id);
    r.has_video = true;
    r.height = Some(height);
    r.content_length = Some(contents.len() as u64);
    r.url = Some(media_file(dir, &format!("{id}.bin"), contents));
    r
}

fn audio_only(dir: &Path, id: &str, kbps: u32, contents: &[u8]) -> RawRendition {
    let mut r = raw_rendition(id);
    r.has_audio = true;
    r.audio_bitrate_kbps = Some(kbps);
    r.content_length = Some(contents.len() as u64);
    r.url = Some(media_file(dir, &format!("{id}.bin"), contents));
    r
}

struct Harness {
    pipeline: Pipeline,
    downloads: PathBuf,
    specs: Arc<Mutex<Vec<ProcessingSpec>>>,
}

fn harness(downloads: &Path, catalog: ScriptedCatalog) -> Harness {
    let mut config = VfetchConfig::default();
    config.paths.downloads_dir = downloads.to_string_lossy().to_string();
    config.download.lookup_backoff_seconds = 0;
    config.download.per_stream_timeout_seconds = 10;

    let engine = ConcatEngine::default();
    let specs = Arc::clone(&engine.specs);
    let coordinator = Coordinator::new(
        Arc::new(engine),
        Duration::from_secs(5),
        config.transcode.audio_codec.clone(),
    );
    let acquisition = AcquisitionEngine::new(
        Arc::new(HttpStreamFetcher::new().unwrap()),
        config.download.per_stream_timeout(),
        config.download.buffer_chunks,
    );
    Harness {
        pipeline: Pipeline::new(Arc::new(catalog), acquisition, coordinator, config),
        downloads: downloads.to_path_buf(),
        specs,
    }
}

fn video_request(quality: QualityPreference) -> OutputRequest {
    OutputRequest {
        kind: OutputKind::VideoWithAudio,
        quality,
    }
}

#[tokio::test]
async fn combined_rendition_takes_the_fast_path() {
    let media = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let catalog = ScriptedCatalog::new(vec![combined(media.path(), "c720", 720, b"COMBINED")]);
    let h = harness(downloads.path(), catalog);

    let artifact = h
        .pipeline
        .run("clip-1", "Test Clip", &video_request(QualityPreference::Best))
        .await
        .unwrap();
    assert_eq!(artifact.path, h.downloads.join("Test_Clip.mp4"));
    assert_eq!(artifact.quality_label, "720p");
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"COMBINED");
    // No processing needed, no temps left behind.
    assert!(h.specs.lock().unwrap().is_empty());
    assert!(!h.downloads.join("Test_Clip.video.part").exists());
    assert!(!h.downloads.join("Test_Clip.mp4.part").exists());
}

#[tokio::test]
async fn dual_streams_are_merged_and_temps_removed() {
    let media = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let catalog = ScriptedCatalog::new(vec![
        video_only(media.path(), "v720", 720, b"VIDEO"),
        audio_only(media.path(), "a160", 160, b"AUDIO"),
    ]);
    let h = harness(downloads.path(), catalog);

    let artifact = h
        .pipeline
        .run("clip-2", "Merged Clip", &video_request(QualityPreference::Best))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"VIDEOAUDIO");
    assert_eq!(artifact.quality_label, "720p");

    let specs = h.specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].inputs.len(), 2);
    assert!(specs[0].codec_args.contains(&"copy".to_string()));
    assert!(specs[0].codec_args.contains(&"160k".to_string()));
    assert!(!h.downloads.join("Merged_Clip.video.part").exists());
    assert!(!h.downloads.join("Merged_Clip.audio.part").exists());
}

#[tokio::test]
async fn audio_only_reencodes_to_requested_bitrate() {
    let media = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let catalog = ScriptedCatalog::new(vec![audio_only(media.path(), "a160", 160, b"PCMDATA")]);
    let h = harness(downloads.path(), catalog);

    let artifact = h
        .pipeline
        .run(
            "clip-3",
            "Podcast",
            &OutputRequest {
                kind: OutputKind::AudioOnly,
                quality: QualityPreference::ExactAudioBitrate(128),
            },
        )
        .await
        .unwrap();
    assert_eq!(artifact.path, h.downloads.join("Podcast.mp3"));
    assert_eq!(artifact.quality_label, "128kbps");

    let specs = h.specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert!(specs[0].codec_args.contains(&"-vn".to_string()));
    assert!(specs[0].codec_args.contains(&"128k".to_string()));
    assert!(!h.downloads.join("Podcast.audio.part").exists());
}

#[tokio::test]
async fn audio_only_best_reencodes_at_default_bitrate() {
    let media = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let catalog = ScriptedCatalog::new(vec![audio_only(media.path(), "a160", 160, b"PCMDATA")]);
    let h = harness(downloads.path(), catalog);

    let artifact = h
        .pipeline
        .run(
            "clip-3b",
            "Interview",
            &OutputRequest {
                kind: OutputKind::AudioOnly,
                quality: QualityPreference::Best,
            },
        )
        .await
        .unwrap();
    // The source declares 160 kbps; a non-exact request still targets
    // the configured default.
    assert_eq!(artifact.quality_label, "192kbps");
    let specs = h.specs.lock().unwrap();
    assert!(specs[0].codec_args.contains(&"192k".to_string()));
    assert!(!specs[0].codec_args.contains(&"160k".to_string()));
}

#[tokio::test]
async fn empty_catalog_reports_no_plan() {
    let downloads = tempfile::tempdir().unwrap();
    let h = harness(downloads.path(), ScriptedCatalog::new(Vec::new()));

    let error = h
        .pipeline
        .run("ghost", "Ghost", &video_request(QualityPreference::Best))
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::PlanNotFound { .. }));
}

#[tokio::test]
async fn transient_lookup_failures_exhaust_retries() {
    let downloads = tempfile::tempdir().unwrap();
    let h = harness(downloads.path(), ScriptedCatalog::always_transient());

    let error = h
        .pipeline
        .run("flaky", "Flaky", &video_request(QualityPreference::Best))
        .await
        .unwrap_err();
    match error {
        PipelineError::LookupExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected LookupExhausted, got {other:?}"),
    }
    assert_eq!(error.kind(), "lookup_exhausted");
}

#[tokio::test]
async fn not_found_source_fails_without_retrying() {
    struct MissingCatalog;

    #[async_trait]
    impl CatalogLookup for MissingCatalog {
        async fn get_renditions(
            &self,
            source_id: &str,
        ) -> Result<Vec<RawRendition>, LookupError> {
            Err(LookupError::NotFound(source_id.to_string()))
        }
    }

    let downloads = tempfile::tempdir().unwrap();
    let mut config = VfetchConfig::default();
    config.paths.downloads_dir = downloads.path().to_string_lossy().to_string();
    let coordinator = Coordinator::new(
        Arc::new(ConcatEngine::default()),
        Duration::from_secs(5),
        "libmp3lame".into(),
    );
    let acquisition = AcquisitionEngine::new(
        Arc::new(HttpStreamFetcher::new().unwrap()),
        Duration::from_secs(5),
        4,
    );
    let pipeline = Pipeline::new(Arc::new(MissingCatalog), acquisition, coordinator, config);

    let error = pipeline
        .run("gone", "Gone", &video_request(QualityPreference::Best))
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::SourceUnavailable { .. }));
}

#[tokio::test]
async fn failed_merge_still_removes_temps_and_working_file() {
    // Engine double that checks its inputs were on disk when it was
    // handed the job, then exits nonzero.
    struct FailingEngine {
        saw_inputs: Arc<Mutex<Vec<bool>>>,
    }

    struct FailedProcess {
        progress: watch::Receiver<f32>,
    }

    #[async_trait]
    impl EngineProcess for FailedProcess {
        fn progress(&self) -> watch::Receiver<f32> {
            self.progress.clone()
        }

        async fn wait(&mut self) -> ProcessResult<ExitOutcome> {
            Ok(ExitOutcome {
                success: false,
                code: Some(1),
                detail: "Invalid data found when processing input".into(),
            })
        }

        async fn kill(&mut self) -> ProcessResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessingEngine for FailingEngine {
        async fn spawn(&self, spec: &ProcessingSpec) -> ProcessResult<Box<dyn EngineProcess>> {
            let mut seen = self.saw_inputs.lock().unwrap();
            for input in &spec.inputs {
                seen.push(input.exists());
            }
            let (tx, rx) = watch::channel(0.0f32);
            drop(tx);
            Ok(Box::new(FailedProcess { progress: rx }))
        }
    }

    let media = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let catalog = ScriptedCatalog::new(vec![
        video_only(media.path(), "v720", 720, b"VIDEO"),
        audio_only(media.path(), "a160", 160, b"AUDIO"),
    ]);

    let mut config = VfetchConfig::default();
    config.paths.downloads_dir = downloads.path().to_string_lossy().to_string();
    config.download.lookup_backoff_seconds = 0;
    let saw_inputs = Arc::new(Mutex::new(Vec::new()));
    let coordinator = Coordinator::new(
        Arc::new(FailingEngine {
            saw_inputs: Arc::clone(&saw_inputs),
        }),
        Duration::from_secs(5),
        config.transcode.audio_codec.clone(),
    );
    let acquisition = AcquisitionEngine::new(
        Arc::new(HttpStreamFetcher::new().unwrap()),
        config.download.per_stream_timeout(),
        config.download.buffer_chunks,
    );
    let pipeline = Pipeline::new(Arc::new(catalog), acquisition, coordinator, config);

    let error = pipeline
        .run(
            "clip-5",
            "Broken Merge",
            &video_request(QualityPreference::Best),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::ProcessingFailed(_)));

    // Both temps were present when the engine ran.
    assert_eq!(*saw_inputs.lock().unwrap(), vec![true, true]);
    // After the failure nothing is left behind, public path included.
    assert!(!downloads.path().join("Broken_Merge.video.part").exists());
    assert!(!downloads.path().join("Broken_Merge.audio.part").exists());
    assert!(!downloads.path().join("Broken_Merge.mp4.part").exists());
    assert!(!downloads.path().join("Broken_Merge.mp4").exists());
}

#[tokio::test]
async fn failed_single_stream_falls_back_to_dual() {
    let media = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();

    // Combined rendition points at a file that does not exist, so the
    // fast path fails after planning succeeded.
    let mut broken = raw_rendition("c1080");
    broken.has_video = true;
    broken.has_audio = true;
    broken.height = Some(1080);
    broken.content_length = Some(64);
    broken.url = Some(format!(
        "file://{}",
        media.path().join("missing.bin").display()
    ));

    let catalog = ScriptedCatalog::new(vec![
        broken,
        video_only(media.path(), "v720", 720, b"VIDEO"),
        audio_only(media.path(), "a128", 128, b"AUDIO"),
    ]);
    let h = harness(downloads.path(), catalog);

    let artifact = h
        .pipeline
        .run(
            "clip-4",
            "Fallback Clip",
            &video_request(QualityPreference::ExactVideoHeight(1080)),
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&artifact.path).unwrap(), b"VIDEOAUDIO");
    // The dual plan's video half is the closest height below 1080.
    assert_eq!(artifact.quality_label, "720p");
    assert_eq!(h.specs.lock().unwrap().len(), 1);
    assert!(!h.downloads.join("Fallback_Clip.mp4.part").exists());
    assert!(!h.downloads.join("Fallback_Clip.video.part").exists());
    assert!(!h.downloads.join("Fallback_Clip.audio.part").exists());
}
