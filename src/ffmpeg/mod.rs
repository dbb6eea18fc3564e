//! Everything that talks to the ffmpeg tool suite: probing a source,
//! choosing streams, copying them to disk and following the progress.

pub mod downloadable;
pub mod probe;
pub mod progress;
pub mod streams;

use std::path::PathBuf;

pub use downloadable::{DownloadState, Downloadable};
pub use probe::{ensure_program_available, executables_present};
pub use progress::{ConsoleProgress, ProgressSample, ProgressSink, ProgressTracker};
pub use streams::{AudioStream, MediaFormat, StreamKind, VideoStream};

/// Protocols ffprobe and ffmpeg may use when opening a source.
pub const PROTOCOL_WHITELIST: &str = "https,tls,tcp";

pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_FFPROBE: &str = "ffprobe";

/// Locations of the external tools. Plain names are looked up in `PATH`.
#[derive(Debug, Clone)]
pub struct Tools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from(DEFAULT_FFMPEG),
            ffprobe: PathBuf::from(DEFAULT_FFPROBE),
        }
    }
}
