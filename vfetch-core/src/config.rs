use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct VfetchConfig {
    pub paths: PathsSection,
    pub download: DownloadSection,
    pub transcode: TranscodeSection,
    pub retention: RetentionSection,
}

impl VfetchConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.downloads_dir).join(path)
        }
    }
}

impl Default for VfetchConfig {
    fn default() -> Self {
        Self {
            paths: PathsSection::default(),
            download: DownloadSection::default(),
            transcode: TranscodeSection::default(),
            retention: RetentionSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub downloads_dir: String,
    pub logs_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            downloads_dir: "downloads".into(),
            logs_dir: "logs".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub per_stream_timeout_seconds: u64,
    pub buffer_chunks: usize,
    pub lookup_max_attempts: u32,
    pub lookup_backoff_seconds: u64,
}

impl DownloadSection {
    pub fn per_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.per_stream_timeout_seconds)
    }
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            per_stream_timeout_seconds: 300,
            buffer_chunks: 64,
            lookup_max_attempts: 3,
            lookup_backoff_seconds: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub ffmpeg_path: String,
    pub audio_format: String,
    pub audio_codec: String,
    pub default_audio_bitrate_kbps: u32,
    pub process_timeout_seconds: u64,
}

impl TranscodeSection {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_seconds)
    }
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            audio_format: "mp3".into(),
            audio_codec: "libmp3lame".into(),
            default_audio_bitrate_kbps: 192,
            process_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSection {
    pub max_age_hours: u64,
}

impl RetentionSection {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours * 3600)
    }
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self { max_age_hours: 24 }
    }
}

pub fn load_vfetch_config<P: AsRef<Path>>(path: P) -> Result<VfetchConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
