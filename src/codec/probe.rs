//! Stream probing with ffprobe

use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::DecoderConfig;
use crate::error::DecodeError;

/// Format of the first audio stream in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub channels: u16,
    pub sample_rate: u32,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    channels: Option<u16>,
    sample_rate: Option<String>,
}

/// Pick the first audio stream out of `ffprobe -print_format json` output
pub fn parse_probe_output(json: &str, path: &str) -> Result<StreamInfo, DecodeError> {
    let output: ProbeOutput =
        serde_json::from_str(json).map_err(|e| DecodeError::ProbeFailed(e.to_string()))?;

    let stream = output
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .ok_or_else(|| DecodeError::NoAudioStream(path.to_string()))?;

    let channels = stream
        .channels
        .filter(|c| *c > 0)
        .ok_or_else(|| DecodeError::ProbeFailed(format!("{}: missing channel count", path)))?;
    let sample_rate = stream
        .sample_rate
        .as_deref()
        .and_then(|rate| rate.parse::<f64>().ok())
        .filter(|rate| *rate > 0.0)
        .ok_or_else(|| DecodeError::ProbeFailed(format!("{}: missing sample rate", path)))?;

    Ok(StreamInfo {
        channels,
        sample_rate: sample_rate.round() as u32,
    })
}

/// Run ffprobe against `path`
pub fn probe(config: &DecoderConfig, path: &Path) -> Result<StreamInfo, DecodeError> {
    let output = Command::new(&config.ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| DecodeError::SpawnFailed {
            program: config.ffprobe.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(DecodeError::ProbeFailed(format!(
            "{} exited with {} for {}",
            config.ffprobe,
            output.status,
            path.display()
        )));
    }

    let json = String::from_utf8_lossy(&output.stdout);
    let info = parse_probe_output(&json, &path.display().to_string())?;
    tracing::debug!(
        "Probed {}: {} channel(s) at {}Hz",
        path.display(),
        info.channels,
        info.sample_rate
    );
    Ok(info)
}
