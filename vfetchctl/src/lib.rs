use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use vfetch_core::{
    load_vfetch_config, AcquisitionEngine, Artifact, Coordinator, FfmpegEngine, HttpStreamFetcher,
    JsonCatalog, OutputKind, OutputRequest, Pipeline, PipelineError, QualityPreference,
    SweepReport, VfetchConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vfetch_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("catalog error: {0}")]
    Catalog(#[from] vfetch_core::LookupError),
    #[error("fetcher error: {0}")]
    Fetcher(#[from] vfetch_core::FetchError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Media rendition fetch pipeline", long_about = None)]
pub struct Cli {
    /// Path to the main vfetch.toml
    #[arg(long, default_value = "configs/vfetch.toml")]
    pub config: PathBuf,
    /// Catalog root: a directory of per-source JSON manifests or an
    /// http(s)/file URL prefix
    #[arg(long, default_value = "catalog")]
    pub catalog: String,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetches one source and produces a finished artifact
    Fetch(FetchArgs),
    /// Lists the renditions the catalog offers for a source
    Renditions(RenditionsArgs),
    /// Removes downloads older than the retention window
    Sweep,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Source identifier in the catalog
    pub source: String,
    /// Output title; defaults to the manifest title, then the source id
    #[arg(long)]
    pub title: Option<String>,
    /// Produce an audio-only artifact
    #[arg(long, default_value_t = false)]
    pub audio_only: bool,
    /// Preferred video height, e.g. 1080
    #[arg(long)]
    pub height: Option<u32>,
    /// Preferred audio bitrate in kbps (audio-only mode)
    #[arg(long)]
    pub audio_kbps: Option<u32>,
}

#[derive(Args, Debug)]
pub struct RenditionsArgs {
    pub source: String,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();
    let config = load_vfetch_config(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Fetch(args) => {
            let request = build_request(args)?;
            let outcome = runtime.block_on(run_fetch(&cli, &config, args, &request));
            render_outcome(outcome, cli.format)
        }
        Commands::Renditions(args) => {
            let listing = runtime.block_on(list_renditions(&cli, args))?;
            render(&listing, cli.format)
        }
        Commands::Sweep => {
            let report = vfetch_core::sweep_stale(
                std::path::Path::new(&config.paths.downloads_dir),
                config.retention.max_age(),
            );
            render(&SweepOutput::from(report), cli.format)
        }
    }
}

fn build_request(args: &FetchArgs) -> Result<OutputRequest> {
    if args.audio_only && args.height.is_some() {
        return Err(AppError::InvalidRequest(
            "--height has no effect with --audio-only".into(),
        ));
    }
    if !args.audio_only && args.audio_kbps.is_some() {
        return Err(AppError::InvalidRequest(
            "--audio-kbps requires --audio-only".into(),
        ));
    }
    let request = if args.audio_only {
        OutputRequest {
            kind: OutputKind::AudioOnly,
            quality: match args.audio_kbps {
                Some(kbps) => QualityPreference::ExactAudioBitrate(kbps),
                None => QualityPreference::Best,
            },
        }
    } else {
        OutputRequest {
            kind: OutputKind::VideoWithAudio,
            quality: match args.height {
                Some(height) => QualityPreference::ExactVideoHeight(height),
                None => QualityPreference::Best,
            },
        }
    };
    Ok(request)
}

async fn run_fetch(
    cli: &Cli,
    config: &VfetchConfig,
    args: &FetchArgs,
    request: &OutputRequest,
) -> Result<Artifact> {
    let catalog = JsonCatalog::new(cli.catalog.clone())?;
    let title = match &args.title {
        Some(title) => title.clone(),
        None => catalog
            .manifest(&args.source)
            .await
            .ok()
            .and_then(|manifest| manifest.title)
            .unwrap_or_else(|| args.source.clone()),
    };

    let fetcher = Arc::new(HttpStreamFetcher::new()?);
    let engine = AcquisitionEngine::new(
        fetcher,
        config.download.per_stream_timeout(),
        config.download.buffer_chunks,
    );
    let coordinator = Coordinator::new(
        Arc::new(FfmpegEngine::new(config.transcode.ffmpeg_path.clone())),
        config.transcode.process_timeout(),
        config.transcode.audio_codec.clone(),
    );
    let pipeline = Pipeline::new(Arc::new(catalog), engine, coordinator, config.clone());
    Ok(pipeline.run(&args.source, &title, request).await?)
}

async fn list_renditions(cli: &Cli, args: &RenditionsArgs) -> Result<RenditionListing> {
    let catalog = JsonCatalog::new(cli.catalog.clone())?;
    let manifest = catalog.manifest(&args.source).await?;
    let renditions = vfetch_core::normalize_renditions(manifest.renditions)
        .into_iter()
        .map(|r| RenditionRow {
            id: r.id,
            container: r.container,
            has_video: r.has_video,
            has_audio: r.has_audio,
            height: r.video_height,
            audio_kbps: r.audio_bitrate_kbps,
            size_hint: r.size_hint,
            schedulable: r.size_hint.is_some() && r.url.is_some(),
        })
        .collect();
    Ok(RenditionListing {
        source: args.source.clone(),
        title: manifest.title,
        renditions,
    })
}

fn render_outcome(outcome: Result<Artifact>, format: OutputFormat) -> Result<()> {
    match outcome {
        Ok(artifact) => render(&FetchOutput::from(artifact), format),
        Err(AppError::Pipeline(err)) => {
            render(&FetchFailure::from(&err), format)?;
            Err(AppError::Pipeline(err))
        }
        Err(other) => Err(other),
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct FetchOutput {
    status: &'static str,
    path: PathBuf,
    size_bytes: u64,
    quality: String,
}

impl From<Artifact> for FetchOutput {
    fn from(artifact: Artifact) -> Self {
        Self {
            status: "ok",
            path: artifact.path,
            size_bytes: artifact.size_bytes,
            quality: artifact.quality_label,
        }
    }
}

impl DisplayFallback for FetchOutput {
    fn display(&self) -> String {
        format!(
            "saved {} ({} bytes, {})",
            self.path.display(),
            self.size_bytes,
            self.quality
        )
    }
}

#[derive(Debug, Serialize)]
struct FetchFailure {
    status: &'static str,
    kind: &'static str,
    message: String,
}

impl From<&PipelineError> for FetchFailure {
    fn from(error: &PipelineError) -> Self {
        Self {
            status: "error",
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl DisplayFallback for FetchFailure {
    fn display(&self) -> String {
        format!("fetch failed ({}): {}", self.kind, self.message)
    }
}

#[derive(Debug, Serialize)]
struct RenditionListing {
    source: String,
    title: Option<String>,
    renditions: Vec<RenditionRow>,
}

#[derive(Debug, Serialize)]
struct RenditionRow {
    id: String,
    container: String,
    has_video: bool,
    has_audio: bool,
    height: Option<u32>,
    audio_kbps: Option<u32>,
    size_hint: Option<u64>,
    schedulable: bool,
}

impl DisplayFallback for RenditionListing {
    fn display(&self) -> String {
        let mut out = format!(
            "{} ({})\n",
            self.source,
            self.title.as_deref().unwrap_or("untitled")
        );
        for row in &self.renditions {
            let streams = match (row.has_video, row.has_audio) {
                (true, true) => "video+audio",
                (true, false) => "video",
                (false, true) => "audio",
                (false, false) => "none",
            };
            out.push_str(&format!(
                "  {:<16} {:<12} {:<6} h={:<5} a={:<4} size={:<10} {}\n",
                row.id,
                streams,
                row.container,
                row.height.map_or("-".into(), |h| h.to_string()),
                row.audio_kbps.map_or("-".into(), |k| k.to_string()),
                row.size_hint.map_or("-".into(), |s| s.to_string()),
                if row.schedulable { "" } else { "(unschedulable)" },
            ));
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
struct SweepOutput {
    removed: usize,
    kept: usize,
    failed: usize,
}

impl From<SweepReport> for SweepOutput {
    fn from(report: SweepReport) -> Self {
        Self {
            removed: report.removed,
            kept: report.kept,
            failed: report.failed,
        }
    }
}

impl DisplayFallback for SweepOutput {
    fn display(&self) -> String {
        format!(
            "sweep complete: removed {}, kept {}, failed {}",
            self.removed, self.kept, self.failed
        )
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
