// Media probing using ffprobe

use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

use super::core::MediaInfo;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to run ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    /// ffprobe exited non-zero; holds its stderr
    #[error("{0}")]
    Failed(String),

    #[error("Failed to parse ffprobe JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

/// Probe a media file for duration, resolution, codecs, bitrates and frame rate
pub fn probe_media(path: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration,bit_rate:stream=codec_type,codec_name,width,height,avg_frame_rate,r_frame_rate,bit_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ProbeError::Failed(if stderr.is_empty() {
            "ffprobe failed".to_string()
        } else {
            stderr
        }));
    }

    parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ffprobe `-of json` output. The first video and first audio stream win.
pub fn parse_ffprobe_json(json: &str) -> Result<MediaInfo, ProbeError> {
    let probe: FfprobeOutput = serde_json::from_str(json)?;
    let mut info = MediaInfo {
        duration_s: probe
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok()),
        ..MediaInfo::default()
    };

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    if let Some(v) = video {
        info.video_codec = v.codec_name.clone();
        info.width = v.width;
        info.height = v.height;
        // avg_frame_rate first; r_frame_rate is the fallback for streams reporting 0/0
        info.fps = v
            .avg_frame_rate
            .as_deref()
            .and_then(parse_fraction)
            .or_else(|| v.r_frame_rate.as_deref().and_then(parse_fraction));
        info.video_bitrate_kbps = v.bit_rate.as_deref().and_then(parse_kbps);
    }
    if let Some(a) = audio {
        info.audio_codec = a.codec_name.clone();
        info.audio_bitrate_kbps = a.bit_rate.as_deref().and_then(parse_kbps);
    }

    // Containers like mkv often carry no per-stream video bitrate
    if info.video_bitrate_kbps.is_none() && video.is_some() {
        let total = probe.format.bit_rate.as_deref().and_then(parse_kbps);
        info.video_bitrate_kbps =
            total.map(|t| t.saturating_sub(info.audio_bitrate_kbps.unwrap_or(0)));
    }

    Ok(info)
}

/// bits/s string to whole kbps
fn parse_kbps(s: &str) -> Option<u32> {
    let bps: f64 = s.trim().parse().ok()?;
    if bps <= 0.0 {
        return None;
    }
    Some((bps / 1000.0).round() as u32)
}

/// Parse a fraction string like "30000/1001" to f64
fn parse_fraction(s: &str) -> Option<f64> {
    let value = match s.split_once('/') {
        Some((num, den)) => {
            let numerator: f64 = num.trim().parse().ok()?;
            let denominator: f64 = den.trim().parse().ok()?;
            if denominator == 0.0 {
                return None;
            }
            numerator / denominator
        }
        None => s.trim().parse().ok()?,
    };
    (value > 0.0).then_some(value)
}
