// Durable per-job records (CSV, optional JSON Lines) and the batch summary file

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::state::BatchSummary;
use super::types::{FailureKind, Job, JobId, JobState, JobStatus, MediaInfo, SkipReason};
use crate::config::LogConfig;

pub const CSV_HEADER: [&str; 22] = [
    "Timestamp",
    "Input Path",
    "Output Path",
    "Original Size (MB)",
    "Output Size (MB)",
    "Size Saved (MB)",
    "Compression Ratio (%)",
    "Duration (s)",
    "Original Resolution",
    "Output Resolution",
    "Original Video Codec",
    "Output Video Codec",
    "Original Audio Codec",
    "Output Audio Codec",
    "Original Video Bitrate (kbps)",
    "Output Video Bitrate (kbps)",
    "Original Audio Bitrate (kbps)",
    "Output Audio Bitrate (kbps)",
    "Frame Rate (fps)",
    "Processing Time (s)",
    "Status",
    "Error Message",
];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Where the reporter writes. `None` disables that output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportPaths {
    pub csv: Option<PathBuf>,
    pub json: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

impl ReportPaths {
    /// Resolve configured paths, defaulting to timestamped files in `output_dir`
    pub fn from_config(log: &LogConfig, output_dir: &Path, now: DateTime<Local>) -> Self {
        let stem = format!("video_processing_log_{}", now.format("%Y%m%d_%H%M%S"));
        let csv_path = log
            .csv_path
            .clone()
            .unwrap_or_else(|| output_dir.join(format!("{}.csv", stem)));
        let json_path = log
            .json_path
            .clone()
            .unwrap_or_else(|| output_dir.join(format!("{}.jsonl", stem)));

        Self {
            summary: Some(summary_path_for(&csv_path)),
            csv: log.enable_csv.then_some(csv_path),
            json: log.enable_json.then_some(json_path),
        }
    }
}

/// `<dir>/<stem>.summary.json` next to a log file
pub fn summary_path_for(log_path: &Path) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video_processing_log".to_string());
    log_path.with_file_name(format!("{}.summary.json", stem))
}

/// CSV status column. The CSV has no cancelled value; cancelled rows read as skipped.
pub fn csv_status(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Completed => "Success",
        JobStatus::Failed => "Failed",
        _ => "Skipped",
    }
}

/// Quote a CSV field when it holds a comma, quote or line break
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn mb(bytes: Option<u64>) -> String {
    format!("{:.3}", bytes.unwrap_or(0) as f64 / BYTES_PER_MB)
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_f2(value: Option<f64>) -> String {
    value
        .filter(|v| *v > 0.0)
        .map(|v| format!("{:.2}", v))
        .unwrap_or_default()
}

fn record_time(job: &Job) -> DateTime<Utc> {
    job.finished_at.unwrap_or_else(Utc::now)
}

/// The 22 CSV fields for one terminal job
pub fn csv_row(job: &Job) -> Vec<String> {
    let mut row = vec![String::new(); CSV_HEADER.len()];
    row[0] = record_time(job).to_rfc3339();
    row[1] = job.source_path.display().to_string();
    row[2] = job.output_path.display().to_string();

    match &job.state {
        JobState::Completed { metrics } => {
            let none = MediaInfo::default();
            let src = metrics.original.as_ref().unwrap_or(&none);
            let out = metrics.output.as_ref().unwrap_or(&none);

            row[3] = mb(metrics.original_bytes);
            row[4] = mb(metrics.output_bytes);
            row[5] = mb(Some(metrics.saved_bytes()));
            row[6] = format!("{:.2}", metrics.compression_ratio_pct());
            row[7] = opt_f2(src.duration_s);
            row[8] = src.resolution().unwrap_or_default();
            row[9] = out.resolution().unwrap_or_default();
            row[10] = src.video_codec.clone().unwrap_or_default();
            row[11] = out.video_codec.clone().unwrap_or_default();
            row[12] = src.audio_codec.clone().unwrap_or_default();
            row[13] = out.audio_codec.clone().unwrap_or_default();
            row[14] = opt(src.video_bitrate_kbps);
            row[15] = opt(out.video_bitrate_kbps);
            row[16] = opt(src.audio_bitrate_kbps);
            row[17] = opt(out.audio_bitrate_kbps);
            row[18] = opt_f2(out.fps.or(src.fps));
            row[19] = format!("{:.2}", metrics.processing_secs);
        }
        JobState::Failed { error } => {
            row[19] = opt_f2(job.processing_secs());
            row[21] = error.message.clone();
        }
        _ => {}
    }
    row[20] = csv_status(job.status()).to_string();
    row
}

fn csv_line(fields: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    fields
        .into_iter()
        .map(|f| csv_escape(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// One JSON Lines entry; keeps the exact job status
#[derive(Debug, Serialize)]
pub struct JsonRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub attempt: u32,
    pub retry_of: Option<JobId>,
    pub input_path: &'a Path,
    pub output_path: &'a Path,
    pub status: JobStatus,
    pub skip_reason: Option<SkipReason>,
    pub error_kind: Option<FailureKind>,
    pub error_message: Option<&'a str>,
    pub input_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
    pub processing_seconds: Option<f64>,
    pub media: Option<&'a MediaInfo>,
    pub output_media: Option<&'a MediaInfo>,
}

impl<'a> JsonRecord<'a> {
    pub fn from_job(job: &'a Job) -> Self {
        let metrics = job.metrics();
        Self {
            timestamp: record_time(job),
            job_id: job.id,
            attempt: job.attempt,
            retry_of: job.retry_of,
            input_path: &job.source_path,
            output_path: &job.output_path,
            status: job.status(),
            skip_reason: match &job.state {
                JobState::Skipped { reason } => Some(*reason),
                _ => None,
            },
            error_kind: job.error().map(|e| e.kind),
            error_message: job.error().map(|e| e.message.as_str()),
            input_bytes: metrics
                .and_then(|m| m.original_bytes)
                .or(job.source_bytes),
            output_bytes: metrics.and_then(|m| m.output_bytes),
            processing_seconds: metrics
                .map(|m| m.processing_secs)
                .or_else(|| job.processing_secs()),
            media: metrics.and_then(|m| m.original.as_ref()),
            output_media: metrics.and_then(|m| m.output.as_ref()),
        }
    }
}

/// Append-only writer for terminal job records
#[derive(Debug, Default)]
pub struct Reporter {
    paths: ReportPaths,
    csv: Option<BufWriter<File>>,
    json: Option<BufWriter<File>>,
}

fn create_file(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

impl Reporter {
    /// A reporter that writes nothing (dry runs)
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the configured files and write the CSV header
    pub fn create(paths: ReportPaths) -> io::Result<Self> {
        let csv = match &paths.csv {
            Some(path) => {
                let mut writer = create_file(path)?;
                writeln!(writer, "{}", csv_line(CSV_HEADER))?;
                writer.flush()?;
                Some(writer)
            }
            None => None,
        };
        let json = match &paths.json {
            Some(path) => Some(create_file(path)?),
            None => None,
        };

        Ok(Self {
            paths,
            csv,
            json,
        })
    }

    /// Append and flush one record for a terminal job
    pub fn record(&mut self, job: &Job) -> io::Result<()> {
        if let Some(writer) = self.csv.as_mut() {
            writeln!(writer, "{}", csv_line(csv_row(job)))?;
            writer.flush()?;
        }
        if let Some(writer) = self.json.as_mut() {
            serde_json::to_writer(&mut *writer, &JsonRecord::from_job(job))?;
            writeln!(writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Sync the logs to disk and (re)write the summary file
    pub fn finish(&mut self, summary: &BatchSummary) -> io::Result<()> {
        for writer in [self.csv.as_mut(), self.json.as_mut()].into_iter().flatten() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        if let Some(path) = &self.paths.summary {
            let mut file = create_file(path)?;
            serde_json::to_writer_pretty(&mut file, summary)?;
            writeln!(file)?;
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        Ok(())
    }
}
