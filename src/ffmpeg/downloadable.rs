//! A single source-to-file copy: probe, pick streams, run ffmpeg and follow
//! its progress.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::{self, ProbeReport};
use super::progress::{ProgressSink, ProgressTracker};
use super::streams::{self, AudioStream, MediaFormat, StreamKind, VideoStream};
use super::{PROTOCOL_WHITELIST, Tools};
use crate::error::{Error, Result};

/// Lifecycle of a [`Downloadable`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Created,
    Probed,
    Selecting,
    Downloading,
    Finished,
    Failed,
}

#[derive(Debug)]
pub struct Downloadable {
    input_url: String,
    output_path: PathBuf,
    tools: Tools,
    state: DownloadState,
    report: ProbeReport,
}

impl Downloadable {
    pub fn new(input_url: impl Into<String>, output_path: impl Into<PathBuf>, tools: Tools) -> Self {
        Self {
            input_url: input_url.into(),
            output_path: output_path.into(),
            tools,
            state: DownloadState::Created,
            report: ProbeReport::default(),
        }
    }

    /// Skips probing when the streams are already known.
    pub fn from_report(
        input_url: impl Into<String>,
        output_path: impl Into<PathBuf>,
        tools: Tools,
        report: ProbeReport,
    ) -> Self {
        Self {
            state: DownloadState::Probed,
            report,
            ..Self::new(input_url, output_path, tools)
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn format(&self) -> MediaFormat {
        self.report.format
    }

    pub fn audio_streams(&self) -> &[AudioStream] {
        &self.report.audio_streams
    }

    pub fn video_streams(&self) -> &[VideoStream] {
        &self.report.video_streams
    }

    pub async fn detect_streams(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state != DownloadState::Created {
            return Err(Error::InvalidState(format!(
                "cannot probe a download in state {:?}",
                self.state
            )));
        }

        match probe::probe(&self.tools, &self.input_url, cancel).await {
            Ok(report) => {
                self.report = report;
                self.state = DownloadState::Probed;
                Ok(())
            }
            Err(err) => {
                self.state = DownloadState::Failed;
                Err(err)
            }
        }
    }

    /// Arguments for copying the two selected streams into the output file.
    pub fn download_args(&self, audio: &AudioStream, video: &VideoStream) -> Vec<String> {
        vec![
            "-protocol_whitelist".to_string(),
            PROTOCOL_WHITELIST.to_string(),
            "-i".to_string(),
            self.input_url.clone(),
            "-map".to_string(),
            format!("0:{}", audio.index),
            "-map".to_string(),
            format!("0:{}", video.index),
            "-c".to_string(),
            "copy".to_string(),
            self.output_path.to_string_lossy().to_string(),
        ]
    }

    /// Copies the best audio and video stream to the output path.
    ///
    /// Progress is forwarded to `sink` from a separate task while this
    /// method waits for ffmpeg. The exit status alone decides success. The
    /// method returns only after ffmpeg has exited and its status output
    /// has been drained.
    pub async fn download(
        &mut self,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.state != DownloadState::Probed {
            return Err(Error::InvalidState(format!(
                "cannot download before probing (state {:?})",
                self.state
            )));
        }

        self.state = DownloadState::Selecting;
        let (audio, video) = match self.select() {
            Ok(selected) => selected,
            Err(err) => {
                self.state = DownloadState::Failed;
                return Err(err);
            }
        };

        info!(
            index = audio.index,
            sample_rate_hz = audio.sample_rate_hz,
            "selected audio stream"
        );
        info!(
            index = video.index,
            width = video.width,
            height = video.height,
            bit_rate_bps = video.bit_rate_bps,
            avg_frame_rate_fps = video.avg_frame_rate_fps,
            "selected video stream"
        );

        self.state = DownloadState::Downloading;
        sink.start().await;
        match self.run_ffmpeg(&audio, &video, sink.clone(), cancel).await {
            Ok(()) => {
                self.state = DownloadState::Finished;
                info!(output = %self.output_path.display(), "finished download");
                sink.finished().await;
                Ok(())
            }
            Err(err) => {
                self.state = DownloadState::Failed;
                sink.error(&err).await;
                Err(err)
            }
        }
    }

    fn select(&self) -> Result<(AudioStream, VideoStream)> {
        let audio = streams::select_audio(&self.report.audio_streams)
            .copied()
            .ok_or(Error::NoStreamAvailable(StreamKind::Audio))?;
        let video = streams::select_video(&self.report.video_streams)
            .copied()
            .ok_or(Error::NoStreamAvailable(StreamKind::Video))?;
        Ok((audio, video))
    }

    async fn run_ffmpeg(
        &self,
        audio: &AudioStream,
        video: &VideoStream,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut child = Command::new(&self.tools.ffmpeg)
            .args(self.download_args(audio, video))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::DownloadSubprocessFailed(format!(
                    "could not start {}: {err}",
                    self.tools.ffmpeg.display()
                ))
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            Error::DownloadSubprocessFailed("status output was not captured".to_string())
        })?;

        let tracker = ProgressTracker::new(self.report.format.duration_millis());
        let reader = tokio::spawn(async move { tracker.track(stderr, sink.as_ref()).await });

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match exited {
            Some(status) => {
                status.map_err(|err| Error::DownloadSubprocessFailed(err.to_string()))
            }
            None => {
                warn!(output = %self.output_path.display(), "download cancelled, stopping ffmpeg");
                if let Err(err) = child.kill().await {
                    warn!("failed to stop ffmpeg: {err}");
                }
                Err(Error::Cancelled)
            }
        };

        match reader.await {
            Ok(samples) => debug!(samples, "status output drained"),
            Err(err) => warn!("progress reader stopped abnormally: {err}"),
        }

        let status = status?;
        if !status.success() {
            return Err(Error::DownloadSubprocessFailed(status.to_string()));
        }
        Ok(())
    }
}
