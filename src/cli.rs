use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use vidproc::config::GpuType;
use vidproc::engine::CollisionPolicy;

#[derive(Parser)]
#[command(name = "vidproc")]
#[command(about = "Batch video transcoder: mirror an input tree into a compressed output tree", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcode every matching file under the input directory (default)
    Run(RunArgs),

    /// List the files a run would pick up
    Scan {
        /// Directory to scan
        directory: PathBuf,

        /// Extensions to include (comma separated, e.g. "mp4,mkv")
        #[arg(long, value_delimiter = ',')]
        extensions: Vec<String>,

        /// Follow symlinks
        #[arg(long)]
        follow_links: bool,
    },

    /// Probe a video file and print its stream facts
    Probe {
        /// Path to the video file
        file: PathBuf,
    },

    /// Check if ffmpeg and ffprobe are installed
    CheckFfmpeg,

    /// Show config status and location, or create default config if missing
    InitConfig,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CollisionArg {
    Skip,
    Overwrite,
    Suffix,
}

impl From<CollisionArg> for CollisionPolicy {
    fn from(arg: CollisionArg) -> Self {
        match arg {
            CollisionArg::Skip => CollisionPolicy::Skip,
            CollisionArg::Overwrite => CollisionPolicy::Overwrite,
            CollisionArg::Suffix => CollisionPolicy::Suffix,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum GpuArg {
    None,
    Nvidia,
    Amd,
    Intel,
    Macos,
}

impl From<GpuArg> for GpuType {
    fn from(arg: GpuArg) -> Self {
        match arg {
            GpuArg::None => GpuType::None,
            GpuArg::Nvidia => GpuType::Nvidia,
            GpuArg::Amd => GpuType::Amd,
            GpuArg::Intel => GpuType::Intel,
            GpuArg::Macos => GpuType::Macos,
        }
    }
}

/// Flags layered over the config file for one run
#[derive(Args, Default)]
pub struct RunArgs {
    /// Input directory (overrides config)
    #[arg(value_name = "INPUT")]
    pub input: Option<PathBuf>,

    /// Output directory (overrides config)
    #[arg(value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    /// Load configuration from this file instead of the default location
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the effective configuration back before starting
    #[arg(long)]
    pub save_config: bool,

    /// Concurrent workers (0 = cores - 1)
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Video codec: h264 or h265
    #[arg(long)]
    pub codec: Option<String>,

    /// Constant rate factor, 0-51
    #[arg(long)]
    pub crf: Option<u8>,

    #[arg(long)]
    pub preset: Option<String>,

    /// Audio codec: aac or opus
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Audio bitrate in kbps
    #[arg(long)]
    pub audio_bitrate: Option<u32>,

    /// Output frame rate
    #[arg(long, conflicts_with = "keep_fps")]
    pub fps: Option<u32>,

    /// Keep the source frame rate
    #[arg(long)]
    pub keep_fps: bool,

    #[arg(long)]
    pub copy_audio: bool,

    /// Remux only, no re-encode
    #[arg(long)]
    pub skip_reencode: bool,

    /// Extra ffmpeg arguments, shell-quoted
    #[arg(long, allow_hyphen_values = true)]
    pub extra_args: Option<String>,

    /// Extensions to include (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// What to do when an output file already exists
    #[arg(long, value_enum)]
    pub collision: Option<CollisionArg>,

    #[arg(long, value_enum)]
    pub gpu: Option<GpuArg>,

    /// Software encoding even when a GPU is configured
    #[arg(long)]
    pub no_gpu: bool,

    /// Resolve every job without encoding or writing anything
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub follow_links: bool,

    /// Seconds to wait for running encodes after Ctrl-C
    #[arg(long, value_name = "SECS")]
    pub cancel_grace: Option<u64>,

    /// Also write a JSON lines log
    #[arg(long)]
    pub json_log: bool,

    #[arg(long)]
    pub no_csv: bool,

    /// Retry failed jobs once after the batch completes
    #[arg(long)]
    pub retry_failed: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
