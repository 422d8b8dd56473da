// Batch transcoding engine - independent of any presentation layer

pub mod aggregator;
pub mod controller;
pub mod core;
pub mod encoder;
pub mod probe;
pub mod worker;

pub use self::core::*;
pub use aggregator::{EventSink, SnapshotBoard};
pub use controller::Controller;
pub use encoder::{
    CancellationToken, EncodeError, EncodeFailure, EncodeReport, EncodeRequest, Encoder,
    FfmpegEncoder,
};
pub use probe::{ProbeError, parse_ffprobe_json, probe_media};
pub use worker::{WorkerContext, WorkerPool, run_job};
