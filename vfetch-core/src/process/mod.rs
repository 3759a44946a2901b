//! External processing engine seam and the merge/transcode coordinator.
//!
//! The engine's event-driven surface (progress lines, exit, signals) is
//! translated into an await-with-cancellation contract: the coordinator
//! blocks the calling task until exit or the wall-clock ceiling, then
//! force-kills on expiry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn processing engine: {0}")]
    Spawn(String),
    #[error("processing engine exited with status {code:?}: {detail}")]
    Exit { code: Option<i32>, detail: String },
    #[error("processing exceeded ceiling of {0:?}")]
    Timeout(Duration),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// What the coordinator asks the engine to run: input files, output file
/// and the codec arguments between them.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSpec {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub codec_args: Vec<String>,
    pub duration_hint: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
    pub detail: String,
}

#[async_trait]
pub trait EngineProcess: Send {
    /// Monotonically non-decreasing completion percentage.
    fn progress(&self) -> watch::Receiver<f32>;
    async fn wait(&mut self) -> ProcessResult<ExitOutcome>;
    async fn kill(&mut self) -> ProcessResult<()>;
}

#[async_trait]
pub trait ProcessingEngine: Send + Sync {
    async fn spawn(&self, spec: &ProcessingSpec) -> ProcessResult<Box<dyn EngineProcess>>;
}

/// Drives the external engine for the two operations the pipeline needs:
/// muxing a video-only and an audio-only file, and re-encoding audio to a
/// target bitrate.
pub struct Coordinator {
    engine: Arc<dyn ProcessingEngine>,
    ceiling: Duration,
    audio_codec: String,
}

impl Coordinator {
    pub fn new(engine: Arc<dyn ProcessingEngine>, ceiling: Duration, audio_codec: String) -> Self {
        Self {
            engine,
            ceiling,
            audio_codec,
        }
    }

    /// Combines separately fetched video and audio streams into one
    /// container: stream copy for video, lossy re-encode for audio.
    /// `container` drives the output muxer; the working file's name
    /// carries a temp suffix the engine cannot infer a format from.
    pub async fn mux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        container: &str,
        audio_bitrate_kbps: u32,
        duration_hint: Option<f64>,
    ) -> ProcessResult<()> {
        let spec = ProcessingSpec {
            inputs: vec![video.to_path_buf(), audio.to_path_buf()],
            output: output.to_path_buf(),
            codec_args: mux_args(&self.audio_codec, audio_bitrate_kbps, container),
            duration_hint,
        };
        self.run_bounded(spec).await
    }

    /// Re-encodes a single audio stream to the requested bitrate and
    /// format.
    pub async fn reencode_audio(
        &self,
        input: &Path,
        output: &Path,
        format: &str,
        bitrate_kbps: u32,
        duration_hint: Option<f64>,
    ) -> ProcessResult<()> {
        let spec = ProcessingSpec {
            inputs: vec![input.to_path_buf()],
            output: output.to_path_buf(),
            codec_args: reencode_args(&self.audio_codec, bitrate_kbps, format),
            duration_hint,
        };
        self.run_bounded(spec).await
    }

    async fn run_bounded(&self, spec: ProcessingSpec) -> ProcessResult<()> {
        let mut process = self.engine.spawn(&spec).await?;
        let mut progress = process.progress();
        let mut progress_open = true;
        let ceiling = sleep(self.ceiling);
        tokio::pin!(ceiling);
        loop {
            tokio::select! {
                outcome = process.wait() => {
                    let outcome = outcome?;
                    if outcome.success {
                        return Ok(());
                    }
                    return Err(ProcessError::Exit {
                        code: outcome.code,
                        detail: outcome.detail,
                    });
                }
                _ = &mut ceiling => {
                    warn!(output = %spec.output.display(), ceiling = ?self.ceiling,
                        "processing ceiling reached, killing engine");
                    if let Err(err) = process.kill().await {
                        warn!(error = %err, "failed to kill processing engine");
                    }
                    return Err(ProcessError::Timeout(self.ceiling));
                }
                changed = progress.changed(), if progress_open => {
                    match changed {
                        Ok(()) => {
                            debug!(percent = *progress.borrow(), "engine progress");
                        }
                        Err(_) => progress_open = false,
                    }
                }
            }
        }
    }
}

fn mux_args(audio_codec: &str, audio_bitrate_kbps: u32, container: &str) -> Vec<String> {
    let mut args = vec![
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        audio_codec.to_string(),
        "-b:a".into(),
        format!("{audio_bitrate_kbps}k"),
    ];
    // `-movflags +faststart` fails outright on non-MP4 containers.
    if is_mp4_family(container) {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    args.push("-f".into());
    args.push(container_muxer(container).to_string());
    args
}

fn reencode_args(audio_codec: &str, bitrate_kbps: u32, format: &str) -> Vec<String> {
    vec![
        "-vn".into(),
        "-c:a".into(),
        audio_codec.to_string(),
        "-b:a".into(),
        format!("{bitrate_kbps}k"),
        "-f".into(),
        container_muxer(format).to_string(),
    ]
}

fn is_mp4_family(container: &str) -> bool {
    matches!(
        container.to_ascii_lowercase().as_str(),
        "mp4" | "m4v" | "m4a" | "mov"
    )
}

// Muxer names where they differ from the file extension.
fn container_muxer(container: &str) -> &str {
    match container {
        "mkv" => "matroska",
        "m4v" | "m4a" | "mov" => "mp4",
        other => other,
    }
}

/// ffmpeg-backed engine. Progress is read from `-progress pipe:1`
/// key/value lines on stdout; stderr is kept for the exit detail.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_path: String,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn build_args(spec: &ProcessingSpec) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
        ];
        for input in &spec.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().to_string());
        }
        args.extend(spec.codec_args.iter().cloned());
        args.push(spec.output.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl ProcessingEngine for FfmpegEngine {
    async fn spawn(&self, spec: &ProcessingSpec) -> ProcessResult<Box<dyn EngineProcess>> {
        let args = Self::build_args(spec);
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "spawning ffmpeg");
        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ProcessError::Spawn(err.to_string()))?;

        let (progress_tx, progress_rx) = watch::channel(0.0f32);
        if let Some(stdout) = child.stdout.take() {
            let duration_hint = spec.duration_hint;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut last = 0.0f32;
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(percent) = parse_progress_line(&line, duration_hint) {
                        // Progress never goes backwards.
                        if percent > last {
                            last = percent;
                            let _ = progress_tx.send(percent);
                        }
                    }
                }
            });
        }

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        Ok(Box::new(FfmpegProcess {
            child,
            progress: progress_rx,
            stderr_task: Some(stderr_task),
        }))
    }
}

struct FfmpegProcess {
    child: Child,
    progress: watch::Receiver<f32>,
    stderr_task: Option<tokio::task::JoinHandle<String>>,
}

#[async_trait]
impl EngineProcess for FfmpegProcess {
    fn progress(&self) -> watch::Receiver<f32> {
        self.progress.clone()
    }

    async fn wait(&mut self) -> ProcessResult<ExitOutcome> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| ProcessError::Spawn(err.to_string()))?;
        let detail = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Ok(ExitOutcome {
            success: status.success(),
            code: status.code(),
            detail: detail.trim().to_string(),
        })
    }

    async fn kill(&mut self) -> ProcessResult<()> {
        self.child
            .kill()
            .await
            .map_err(|err| ProcessError::Spawn(err.to_string()))
    }
}

/// Parses one `-progress pipe:1` line into a percentage against the
/// duration hint. `progress=end` always maps to 100.
fn parse_progress_line(line: &str, duration_hint: Option<f64>) -> Option<f32> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(100.0),
        "out_time_ms" => {
            let micros: f64 = value.parse().ok()?;
            let total = duration_hint?;
            if total <= 0.0 {
                return None;
            }
            let percent = (micros / 1_000_000.0) / total * 100.0;
            Some(percent.clamp(0.0, 100.0) as f32)
        }
        _ => None,
    }
}
