//! Follows ffmpeg's status output and turns `time=HH:MM:SS.fff` tokens into
//! progress samples.

use std::io::Write;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tokio::io::AsyncRead;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Stand-in for the remaining time while nothing has been copied yet.
pub const REMAINING_UNKNOWN: Duration = Duration::MAX;

/// ffmpeg rewrites its status line with `\r`, so both terminators split.
const LINE_DELIMITERS: &[u8] = b"\r\n";
const MAX_LINE_LENGTH: usize = 64 * 1024;

static TIME_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=(\d+):(\d+):(\d+)\.(\d+)").expect("time token pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Fraction of the source duration copied so far. May exceed 1 when the
    /// probed duration was short.
    pub relative_completed: f64,
    pub elapsed: Duration,
    pub remaining: Duration,
}

impl ProgressSample {
    pub fn remaining_known(&self) -> bool {
        self.remaining != REMAINING_UNKNOWN
    }
}

/// Receives the lifecycle of a single download.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn start(&self);
    async fn update(&self, sample: ProgressSample);
    async fn error(&self, err: &Error);
    async fn finished(&self);
}

/// Converts a matched timestamp into milliseconds.
///
/// The fraction holds one to three digits and is scaled to milliseconds
/// (`6` is 600ms, `67` is 670ms). Minutes and seconds must be below 60.
pub fn parse_time_millis(hours: &str, minutes: &str, seconds: &str, fraction: &str) -> Result<u64> {
    let h: u64 = hours
        .parse()
        .map_err(|_| Error::malformed(format!("invalid hours {hours:?}")))?;

    let m: u64 = minutes
        .parse()
        .map_err(|_| Error::malformed(format!("invalid minutes {minutes:?}")))?;
    if m > 59 {
        return Err(Error::malformed(format!(
            "minutes must be between 0 and 59 inclusive: {m}"
        )));
    }

    let s: u64 = seconds
        .parse()
        .map_err(|_| Error::malformed(format!("invalid seconds {seconds:?}")))?;
    if s > 59 {
        return Err(Error::malformed(format!(
            "seconds must be between 0 and 59 inclusive: {s}"
        )));
    }

    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::malformed(format!("invalid fraction {fraction:?}")));
    }
    let scale = match fraction.len() {
        1 => 100,
        2 => 10,
        3 => 1,
        _ => {
            return Err(Error::malformed(format!(
                "fraction {fraction:?} has unsupported length"
            )));
        }
    };
    let ms: u64 = fraction
        .parse::<u64>()
        .map_err(|_| Error::malformed(format!("invalid fraction {fraction:?}")))?
        * scale;

    h.checked_mul(3_600_000)
        .and_then(|total| total.checked_add(m * 60_000 + s * 1_000 + ms))
        .ok_or_else(|| Error::malformed(format!("hours out of range: {h}")))
}

/// Turns positions into samples relative to a known total duration.
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    started: Instant,
    duration_millis: u64,
}

impl ProgressTracker {
    /// Starts the wall clock now.
    pub fn new(duration_millis: u64) -> Self {
        Self {
            started: Instant::now(),
            duration_millis,
        }
    }

    pub fn sample(&self, position_millis: u64, elapsed: Duration) -> ProgressSample {
        if self.duration_millis == 0 {
            return ProgressSample {
                relative_completed: 0.0,
                elapsed,
                remaining: REMAINING_UNKNOWN,
            };
        }

        let ratio = position_millis as f64 / self.duration_millis as f64;
        let remaining = if ratio > 0.0 {
            let secs = (elapsed.as_secs_f64() * (1.0 / ratio - 1.0)).max(0.0).trunc();
            Duration::try_from_secs_f64(secs).unwrap_or(REMAINING_UNKNOWN)
        } else {
            REMAINING_UNKNOWN
        };

        ProgressSample {
            relative_completed: ratio,
            elapsed,
            remaining,
        }
    }

    /// `None` for lines without a timestamp token.
    pub fn parse_line(&self, line: &str) -> Option<Result<ProgressSample>> {
        let caps = TIME_TOKEN.captures(line)?;
        let position = parse_time_millis(&caps[1], &caps[2], &caps[3], &caps[4]);
        Some(position.map(|millis| self.sample(millis, self.started.elapsed())))
    }

    /// Reads `reader` until EOF and forwards every sample to `sink`.
    /// Returns the number of samples delivered.
    ///
    /// The pipe is always drained to EOF so ffmpeg never writes into a
    /// closed pipe. Unreadable output is logged, never reported to `sink`:
    /// only the exit status decides whether the copy failed.
    pub async fn track<R>(&self, mut reader: R, sink: &dyn ProgressSink) -> usize
    where
        R: AsyncRead + Unpin,
    {
        let mut delivered = 0;

        loop {
            let outcome = {
                let codec = AnyDelimiterCodec::new_with_max_length(
                    LINE_DELIMITERS.to_vec(),
                    Vec::new(),
                    MAX_LINE_LENGTH,
                );
                let mut lines = FramedRead::new(&mut reader, codec);
                let mut outcome = ReadOutcome::Eof;

                while let Some(chunk) = lines.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                            outcome = ReadOutcome::Overlong;
                            break;
                        }
                        Err(AnyDelimiterCodecError::Io(err)) => {
                            outcome = ReadOutcome::Failed(err);
                            break;
                        }
                    };

                    let line = String::from_utf8_lossy(&chunk);
                    match self.parse_line(&line) {
                        None => {}
                        Some(Ok(sample)) => {
                            sink.update(sample).await;
                            delivered += 1;
                        }
                        Some(Err(err)) => debug!("skipping status line: {err}"),
                    }
                }
                outcome
            };

            match outcome {
                ReadOutcome::Eof => break,
                // Start over with a fresh codec; the rest of the long chunk
                // carries no timestamp we could still use.
                ReadOutcome::Overlong => debug!("skipping overlong ffmpeg status output"),
                ReadOutcome::Failed(err) => {
                    warn!("reading ffmpeg status output failed: {err}");
                    if let Err(err) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                        debug!("draining ffmpeg status output failed: {err}");
                    }
                    break;
                }
            }
        }

        delivered
    }
}

enum ReadOutcome {
    Eof,
    Overlong,
    Failed(std::io::Error),
}

/// Renders whole seconds as `1h2m3s`, `4m5s` or `6s`.
pub fn format_duration(duration: Duration) -> String {
    if duration == REMAINING_UNKNOWN {
        return "unknown".to_string();
    }
    let total = duration.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Prints a single, continuously rewritten progress line to stdout.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

#[async_trait]
impl ProgressSink for ConsoleProgress {
    async fn start(&self) {
        println!("Starting download ...");
    }

    async fn update(&self, sample: ProgressSample) {
        let elapsed = format_duration(Duration::from_secs(sample.elapsed.as_secs()));
        let mut stdout = std::io::stdout().lock();
        let _ = if sample.remaining_known() {
            write!(
                stdout,
                "Download progress: {:5.1}% | Elapsed: {:>10} | Remaining: {:>10}\r",
                sample.relative_completed * 100.0,
                elapsed,
                format_duration(sample.remaining)
            )
        } else {
            write!(
                stdout,
                "Download progress: {:5.1}% | Elapsed: {:>10}\r",
                sample.relative_completed * 100.0,
                elapsed
            )
        };
        let _ = stdout.flush();
    }

    async fn error(&self, err: &Error) {
        println!();
        eprintln!("Download failed: {err}");
    }

    async fn finished(&self) {
        println!();
        println!("Finished download.");
    }
}
