// Run configuration: encode profile, batch behavior and log destinations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::CollisionPolicy;

/// x264/x265 preset names accepted by `encode.preset`
pub const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

pub const VIDEO_CODECS: &[&str] = &["h264", "h265"];
pub const AUDIO_CODECS: &[&str] = &["aac", "opus"];

/// Default extension allow-list (normalized form: lower case, leading dot)
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".mov", ".avi", ".webm", ".wmv", ".m4v", ".mpg", ".mpeg", ".flv", ".3gp",
    ".ogv",
];

/// Configuration validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("video_codec must be one of {allowed:?}, got '{got}'")]
    VideoCodec { got: String, allowed: &'static [&'static str] },

    #[error("audio_codec must be one of {allowed:?}, got '{got}'")]
    AudioCodec { got: String, allowed: &'static [&'static str] },

    #[error("crf must be between 0 and 51, got {0}")]
    Crf(u8),

    #[error("preset '{0}' is not a known encoder preset")]
    Preset(String),

    #[error("audio_bitrate_kbps must be positive")]
    AudioBitrate,

    #[error("target_fps must be positive when set")]
    TargetFps,

    #[error("extension allow-list is empty")]
    NoExtensions,

    #[error("{0} directory is not set")]
    MissingDir(&'static str),

    #[error("output directory {output} must not be inside input directory {input}")]
    OutputInsideInput { input: PathBuf, output: PathBuf },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encode: EncodeConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub hardware: HardwareConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Compression profile handed to the encoder for every job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// "h264" or "h265"
    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_crf")]
    pub crf: u8,

    #[serde(default = "default_preset")]
    pub preset: String,

    /// "aac" or "opus"
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,

    /// Output frame rate; `None` keeps the source rate
    #[serde(default = "default_target_fps")]
    pub target_fps: Option<u32>,

    /// Copy the audio stream instead of re-encoding it
    #[serde(default)]
    pub copy_audio: bool,

    /// Stream-copy everything (remux only)
    #[serde(default)]
    pub skip_reencode: bool,

    /// Extra ffmpeg arguments, shell-quoted, inserted before the output path
    #[serde(default)]
    pub extra_args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    #[serde(default)]
    pub input_dir: PathBuf,

    #[serde(default)]
    pub output_dir: PathBuf,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Concurrent workers; 0 picks max(1, cores - 1)
    #[serde(default)]
    pub workers: usize,

    #[serde(default)]
    pub collision_policy: CollisionPolicy,

    #[serde(default)]
    pub dry_run: bool,

    /// Follow symlinks while scanning (loops are reported as warnings)
    #[serde(default)]
    pub follow_links: bool,

    /// Seconds to wait for running workers after cancel before completing anyway
    #[serde(default)]
    pub cancel_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GpuType {
    #[default]
    None,
    Nvidia,
    Amd,
    Intel,
    Macos,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    #[serde(default)]
    pub gpu_type: GpuType,

    #[serde(default = "default_true")]
    pub use_gpu: bool,

    #[serde(default = "default_true")]
    pub use_hw_decode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enable_csv: bool,

    /// Explicit CSV path; defaults to a timestamped file in the output directory
    #[serde(default)]
    pub csv_path: Option<PathBuf>,

    #[serde(default)]
    pub enable_json: bool,

    #[serde(default)]
    pub json_path: Option<PathBuf>,
}

fn default_video_codec() -> String {
    "h265".to_string()
}

fn default_crf() -> u8 {
    23
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_target_fps() -> Option<u32> {
    Some(30)
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            crf: default_crf(),
            preset: default_preset(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate(),
            target_fps: default_target_fps(),
            copy_audio: false,
            skip_reencode: false,
            extra_args: String::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            extensions: default_extensions(),
            workers: 0,
            collision_policy: CollisionPolicy::default(),
            dry_run: false,
            follow_links: false,
            cancel_grace_secs: None,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            gpu_type: GpuType::None,
            use_gpu: true,
            use_hw_decode: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enable_csv: true,
            csv_path: None,
            enable_json: false,
            json_path: None,
        }
    }
}

/// Normalize an extension list: lower case, leading dot, no blanks, no duplicates.
/// Order of first appearance is kept.
pub fn normalize_extensions<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result: Vec<String> = Vec::new();
    for value in values {
        let ext = value.as_ref().trim().to_lowercase();
        if ext.is_empty() || ext == "." {
            continue;
        }
        let ext = if ext.starts_with('.') {
            ext
        } else {
            format!(".{}", ext)
        };
        if !result.contains(&ext) {
            result.push(ext);
        }
    }
    result
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".config")
                .join("vidproc")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("vidproc")
        };

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load and normalize a config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.normalize();

        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Check if config file exists
    pub fn exists() -> bool {
        Self::config_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Create a default config file if it doesn't exist
    pub fn ensure_default() -> Result<()> {
        if !Self::exists() {
            Config::default().save()?;
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.encode.video_codec = self.encode.video_codec.trim().to_lowercase();
        self.encode.audio_codec = self.encode.audio_codec.trim().to_lowercase();
        self.encode.preset = self.encode.preset.trim().to_lowercase();
        self.batch.extensions = normalize_extensions(&self.batch.extensions);
    }

    /// Validate everything a batch needs before any job may start
    pub fn validate(&self) -> Result<(), ConfigError> {
        let encode = &self.encode;
        if !VIDEO_CODECS.contains(&encode.video_codec.as_str()) {
            return Err(ConfigError::VideoCodec {
                got: encode.video_codec.clone(),
                allowed: VIDEO_CODECS,
            });
        }
        if !AUDIO_CODECS.contains(&encode.audio_codec.as_str()) {
            return Err(ConfigError::AudioCodec {
                got: encode.audio_codec.clone(),
                allowed: AUDIO_CODECS,
            });
        }
        if encode.crf > 51 {
            return Err(ConfigError::Crf(encode.crf));
        }
        if !PRESETS.contains(&encode.preset.as_str()) {
            return Err(ConfigError::Preset(encode.preset.clone()));
        }
        if encode.audio_bitrate_kbps == 0 {
            return Err(ConfigError::AudioBitrate);
        }
        if encode.target_fps == Some(0) {
            return Err(ConfigError::TargetFps);
        }

        let batch = &self.batch;
        if batch.extensions.is_empty() {
            return Err(ConfigError::NoExtensions);
        }
        if batch.input_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDir("input"));
        }
        if batch.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDir("output"));
        }
        if output_inside_input(&batch.input_dir, &batch.output_dir) {
            return Err(ConfigError::OutputInsideInput {
                input: batch.input_dir.clone(),
                output: batch.output_dir.clone(),
            });
        }

        Ok(())
    }

    /// Worker count with the 0 = auto rule applied
    pub fn effective_workers(&self) -> usize {
        if self.batch.workers > 0 {
            self.batch.workers
        } else {
            default_workers(num_cpus::get())
        }
    }
}

/// Conservative default pool size: leave one core for the rest of the system
pub fn default_workers(cores: usize) -> usize {
    cores.saturating_sub(1).max(1)
}

fn output_inside_input(input: &Path, output: &Path) -> bool {
    // Canonicalize when possible so "./in/../in/out" style paths are caught
    let input = fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf());
    let output = canonical_prefix(output);
    output.starts_with(&input)
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest
fn canonical_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut resolved = fs::canonicalize(&existing).unwrap_or(existing);
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}
