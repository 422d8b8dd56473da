// ffmpeg/ffprobe availability checks

use anyhow::{Context, Result};
use std::process::Command;

fn tool_version(tool: &str) -> Result<String> {
    let output = Command::new(tool)
        .arg("-version")
        .output()
        .with_context(|| format!("Failed to execute {tool}. Is {tool} installed and in PATH?"))?;

    if !output.status.success() {
        anyhow::bail!("{} command failed with status: {}", tool, output.status);
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let first_line = version_output.lines().next().unwrap_or("Unknown version");

    Ok(first_line.to_string())
}

/// Check if ffmpeg is available and return its version line
pub fn ffmpeg_version() -> Result<String> {
    tool_version("ffmpeg")
}

/// Check if ffprobe is available and return its version line
pub fn ffprobe_version() -> Result<String> {
    tool_version("ffprobe")
}

/// Both tools must run before a batch may start
pub fn check_ffmpeg() -> Result<(String, String)> {
    Ok((ffmpeg_version()?, ffprobe_version()?))
}
