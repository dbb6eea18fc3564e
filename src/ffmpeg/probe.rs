//! Runs ffprobe against a source and normalizes its JSON report.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::bail;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::streams::{AudioStream, MediaFormat, VideoStream};
use super::{PROTOCOL_WHITELIST, Tools};
use crate::error::{Error, Result};

/// Result of a successful probe.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeReport {
    pub format: MediaFormat,
    pub audio_streams: Vec<AudioStream>,
    pub video_streams: Vec<VideoStream>,
}

/// Subset of `ffprobe -print_format json -show_format -show_streams`.
#[derive(Debug, Deserialize)]
struct RawReport {
    format: RawFormat,
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    /// Seconds, as a decimal string.
    duration: String,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    index: u32,
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    sample_rate: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

pub fn probe_args(input_url: &str) -> Vec<String> {
    [
        "-protocol_whitelist",
        PROTOCOL_WHITELIST,
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        "-i",
        input_url,
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Runs ffprobe once and parses its output. Any failure fails the whole
/// probe; partial results are never returned.
pub async fn probe(
    tools: &Tools,
    input_url: &str,
    cancel: &CancellationToken,
) -> Result<ProbeReport> {
    let mut command = Command::new(&tools.ffprobe);
    command
        .args(probe_args(input_url))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    debug!(program = %tools.ffprobe.display(), "spawning ffprobe");
    let child = command
        .spawn()
        .map_err(|err| Error::probe(format!("could not start {}: {err}", tools.ffprobe.display())))?;

    // Dropping the output future on cancellation kills the child.
    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|err| Error::probe(err.to_string()))?,
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    };

    if !output.status.success() {
        return Err(Error::probe(output.status.to_string()));
    }

    let report = parse_report(&output.stdout)?;
    info!(
        duration_ms = report.format.duration_millis(),
        audio = report.audio_streams.len(),
        video = report.video_streams.len(),
        "probed source"
    );
    Ok(report)
}

/// Turns raw ffprobe JSON into a [`ProbeReport`]. Streams other than audio
/// and video are skipped.
pub fn parse_report(raw: &[u8]) -> Result<ProbeReport> {
    let raw: RawReport = serde_json::from_slice(raw)
        .map_err(|err| Error::probe(format!("failed to decode ffprobe output: {err}")))?;

    let seconds: f64 = raw.format.duration.trim().parse().map_err(|_| {
        Error::probe(format!("failed to parse duration {:?}", raw.format.duration))
    })?;
    let millis = (seconds * 1000.0).round();
    // Progress is relative to the duration, so it has to be positive.
    if !millis.is_finite() || millis < 1.0 {
        return Err(Error::probe(format!("invalid duration {:?}", raw.format.duration)));
    }
    let format = MediaFormat {
        duration: Duration::from_millis(millis as u64),
    };

    let mut audio_streams = Vec::new();
    let mut video_streams = Vec::new();
    for stream in raw.streams {
        match stream.codec_type.as_str() {
            "audio" => audio_streams.push(audio_stream(&stream)?),
            "video" => video_streams.push(video_stream(&stream)?),
            other => debug!(index = stream.index, codec_type = other, "skipping stream"),
        }
    }

    Ok(ProbeReport {
        format,
        audio_streams,
        video_streams,
    })
}

fn audio_stream(stream: &RawStream) -> Result<AudioStream> {
    let sample_rate_hz = parse_number(stream.sample_rate.as_deref(), "sample rate", stream.index)?;
    Ok(AudioStream {
        index: stream.index,
        sample_rate_hz,
    })
}

fn video_stream(stream: &RawStream) -> Result<VideoStream> {
    let width = stream
        .width
        .ok_or_else(|| missing_field("width", stream.index))?;
    let height = stream
        .height
        .ok_or_else(|| missing_field("height", stream.index))?;

    // "30000/1001" and "25" are both valid; only the numerator counts.
    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .map(|value| value.split_once('/').map_or(value, |(numerator, _)| numerator));
    let avg_frame_rate_fps = parse_number(frame_rate, "average frame rate", stream.index)?;
    let bit_rate_bps = parse_number(stream.bit_rate.as_deref(), "bit rate", stream.index)?;

    Ok(VideoStream {
        index: stream.index,
        width,
        height,
        bit_rate_bps,
        avg_frame_rate_fps,
    })
}

fn parse_number<T: std::str::FromStr>(value: Option<&str>, field: &str, index: u32) -> Result<T> {
    let value = value.ok_or_else(|| missing_field(field, index))?;
    value
        .trim()
        .parse()
        .map_err(|_| Error::probe(format!("failed to parse {field} from {value:?} (stream #{index})")))
}

fn missing_field(field: &str, index: u32) -> Error {
    Error::probe(format!("stream #{index} has no {field}"))
}

/// Runs `<program> -version` to fail loudly when a tool is missing.
pub fn ensure_program_available(program: &Path) -> anyhow::Result<()> {
    let status = std::process::Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {}",
            program.display(),
            err
        ),
    }
}

/// Both ffmpeg and ffprobe must be runnable before anything is downloaded.
pub fn executables_present(tools: &Tools) -> anyhow::Result<()> {
    ensure_program_available(&tools.ffmpeg)?;
    ensure_program_available(&tools.ffprobe)?;
    Ok(())
}
