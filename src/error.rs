//! Error taxonomy shared by the prober, the downloader and the queue.
//!
//! The `Display` text of every variant is what observers see as the
//! `reason` of a `downloadErrored` event, so messages are kept short and
//! human readable.

use std::time::Duration;

use thiserror::Error;

use crate::ffmpeg::streams::StreamKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// ffprobe could not be run, exited non-zero, or produced a report we
    /// could not make sense of.
    #[error("failed to run ffprobe: {0}")]
    ProbeFailed(String),

    #[error("failed to get best {0} stream")]
    NoStreamAvailable(StreamKind),

    #[error("ffmpeg failed: {0}")]
    DownloadSubprocessFailed(String),

    #[error("{0}")]
    StreamResolutionFailed(String),

    #[error("{0}")]
    ListingFailed(String),

    /// Per-line parse failure inside the progress parser. Never leaves the
    /// parser.
    #[error("malformed progress line: {0}")]
    MalformedProgressLine(String),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::ProbeFailed(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::StreamResolutionFailed(msg.into())
    }

    pub fn listing(msg: impl Into<String>) -> Self {
        Self::ListingFailed(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedProgressLine(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_read_like_sentences() {
        assert_eq!(
            Error::probe("exit status: 1").to_string(),
            "failed to run ffprobe: exit status: 1"
        );
        assert_eq!(
            Error::NoStreamAvailable(StreamKind::Video).to_string(),
            "failed to get best video stream"
        );
        assert_eq!(
            Error::TimedOut(Duration::from_millis(30_500)).to_string(),
            "timed out after 30s"
        );
        assert_eq!(
            Error::resolution("failed to get recording with status 404").to_string(),
            "failed to get recording with status 404"
        );
    }
}
