//! Normalized stream descriptors and the rules for picking the best ones.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStream {
    pub index: u32,
    pub sample_rate_hz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoStream {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub bit_rate_bps: u64,
    /// Numerator of the reported `avg_frame_rate`.
    pub avg_frame_rate_fps: u32,
}

/// Container-level facts about a probed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaFormat {
    pub duration: Duration,
}

impl MediaFormat {
    pub fn duration_millis(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Picks the audio stream with the highest sample rate. The first candidate
/// wins ties.
pub fn select_audio(candidates: &[AudioStream]) -> Option<&AudioStream> {
    if let [only] = candidates {
        return Some(only);
    }

    let mut best: Option<&AudioStream> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.sample_rate_hz <= current.sample_rate_hz => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Picks a video stream by dominance: a later candidate only replaces the
/// current best when it is strictly larger in width, height and frame rate
/// at the same time. Candidates that win on some axes but not all never
/// replace the current best, so the outcome follows the report order when
/// no stream dominates the others.
pub fn select_video(candidates: &[VideoStream]) -> Option<&VideoStream> {
    if let [only] = candidates {
        return Some(only);
    }

    let mut best: Option<&VideoStream> = None;
    for candidate in candidates {
        match best {
            Some(current) if !dominates(candidate, current) => {}
            _ => best = Some(candidate),
        }
    }
    best
}

fn dominates(candidate: &VideoStream, current: &VideoStream) -> bool {
    candidate.width > current.width
        && candidate.height > current.height
        && candidate.avg_frame_rate_fps > current.avg_frame_rate_fps
}
