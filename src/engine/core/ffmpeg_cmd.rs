// ffmpeg command construction

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use uuid::Uuid;

use super::types::EncodeSettings;
use crate::config::{GpuType, HardwareConfig};

/// Software or GPU video encoder for a codec name, plus the matching decode hwaccel
pub fn video_encoder(codec: &str, hw: &HardwareConfig) -> (&'static str, Option<&'static str>) {
    let h265 = codec == "h265";
    if !hw.use_gpu {
        return (if h265 { "libx265" } else { "libx264" }, None);
    }
    match hw.gpu_type {
        GpuType::None => (if h265 { "libx265" } else { "libx264" }, None),
        GpuType::Nvidia => (if h265 { "hevc_nvenc" } else { "h264_nvenc" }, Some("cuda")),
        GpuType::Amd => (if h265 { "hevc_amf" } else { "h264_amf" }, Some("d3d11va")),
        GpuType::Intel => (if h265 { "hevc_qsv" } else { "h264_qsv" }, Some("qsv")),
        GpuType::Macos => (
            if h265 {
                "hevc_videotoolbox"
            } else {
                "h264_videotoolbox"
            },
            Some("videotoolbox"),
        ),
    }
}

pub fn audio_encoder(codec: &str) -> &'static str {
    match codec {
        "opus" => "libopus",
        _ => "aac",
    }
}

fn wants_faststart(output: &Path) -> bool {
    output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "mp4" | "mov"))
        .unwrap_or(false)
}

/// Split user-supplied extra arguments, respecting shell quoting
fn split_extra_args(extra: &str) -> Vec<String> {
    if extra.trim().is_empty() {
        return Vec::new();
    }
    shlex::split(extra).unwrap_or_else(|| {
        tracing::warn!(extra, "unbalanced quotes in extra_args, splitting on whitespace");
        extra.split_whitespace().map(str::to_string).collect()
    })
}

/// ffmpeg arguments (without the program name) transcoding `input` into `output`
pub fn build_ffmpeg_args(input: &Path, output: &Path, settings: &EncodeSettings) -> Vec<OsString> {
    let encode = &settings.encode;
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        if settings.overwrite { "-y" } else { "-n" }.into(),
    ];

    if encode.skip_reencode {
        args.push("-i".into());
        args.push(input.as_os_str().to_owned());
        for a in ["-c", "copy", "-map_metadata", "0"] {
            args.push(a.into());
        }
    } else {
        let (vcodec, hwaccel) = video_encoder(&encode.video_codec, &settings.hardware);
        if let Some(accel) = hwaccel.filter(|_| settings.hardware.use_hw_decode) {
            args.push("-hwaccel".into());
            args.push(accel.into());
        }

        args.push("-i".into());
        args.push(input.as_os_str().to_owned());
        for a in ["-map_metadata", "0", "-map", "0:v:0?", "-map", "0:a:0?", "-c:v", vcodec] {
            args.push(a.into());
        }
        args.push("-preset".into());
        args.push(encode.preset.clone().into());
        args.push("-crf".into());
        args.push(encode.crf.to_string().into());

        if !encode.copy_audio {
            args.push("-b:a".into());
            args.push(format!("{}k", encode.audio_bitrate_kbps).into());
        }
        if let Some(fps) = encode.target_fps {
            args.push("-r".into());
            args.push(fps.to_string().into());
        }

        args.push("-c:a".into());
        if encode.copy_audio {
            args.push("copy".into());
        } else {
            args.push(audio_encoder(&encode.audio_codec).into());
            if encode.audio_codec == "opus" {
                // libopus in mp4/mov is still flagged experimental
                args.push("-strict".into());
                args.push("experimental".into());
            }
        }

        if wants_faststart(output) {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }
    }

    for extra in split_extra_args(&encode.extra_args) {
        args.push(extra.into());
    }

    // Machine-readable progress on stdout, errors only on stderr
    for a in ["-progress", "pipe:1", "-loglevel", "error"] {
        args.push(a.into());
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Build the ffmpeg command for one transcode
pub fn build_ffmpeg_cmd(input: &Path, output: &Path, settings: &EncodeSettings) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(build_ffmpeg_args(input, output, settings));
    cmd
}

/// Format a command as a shell-safe string for display and logs
pub fn format_ffmpeg_cmd(cmd: &Command) -> String {
    let words: Vec<String> = std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    shlex::try_join(words.iter().map(String::as_str)).unwrap_or_else(|_| words.join(" "))
}

/// Hidden sibling the encoder writes to before the final rename:
/// `name.mp4` -> `.name.<uuid>.partial.mp4`. The random token keeps it
/// apart from every other job's final or partial path in the same directory.
pub fn partial_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = Uuid::new_v4().simple();
    let name = match output.extension() {
        Some(ext) => format!(".{}.{}.partial.{}", stem, token, ext.to_string_lossy()),
        None => format!(".{}.{}.partial", stem, token),
    };
    output.with_file_name(name)
}
