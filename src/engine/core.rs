mod collision;
mod error;
mod events;
mod ffmpeg_cmd;
mod ffmpeg_info;
mod log;
mod queue;
mod scan;
mod state;
mod types;

pub use collision::{
    CollisionPolicy, CollisionResolver, Decision, MAX_SUFFIX_ATTEMPTS, ensure_parent_dir,
    suffixed_path,
};
pub use error::EngineError;
pub use events::EngineEvent;
pub use ffmpeg_cmd::{
    audio_encoder, build_ffmpeg_args, build_ffmpeg_cmd, format_ffmpeg_cmd, partial_output_path,
    video_encoder,
};
pub use ffmpeg_info::{check_ffmpeg, ffmpeg_version, ffprobe_version};
pub use log::{
    CSV_HEADER, JsonRecord, ReportPaths, Reporter, csv_escape, csv_row, csv_status,
    summary_path_for,
};
pub use queue::JobQueue;
pub use scan::{ScanEntry, ScanItem, ScanIter, ScanWarning, Scanner, is_allowed};
pub use state::{BatchSnapshot, BatchState, BatchSummary, ControlSignal, Phase, StatusCounts};
pub use types::{
    EncodeSettings, FailureKind, Job, JobError, JobId, JobMetrics, JobOutcome, JobState,
    JobStatus, MediaInfo, ProgressParser, SkipReason, TransitionError,
};
