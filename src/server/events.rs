//! Messages pushed to every connected observer.
//!
//! Serialized as an object with exactly one of the keys `queueUpdated`,
//! `downloadStarted`, `progressUpdated`, `stateUpdated` or `downloadErrored`.

use serde::{Deserialize, Serialize};

use crate::ffmpeg::progress::{ProgressSample, format_duration};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(rename = "recordingId")]
    pub recording_id: i64,
    #[serde(rename = "filename")]
    pub output_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    GetStreamUrl,
    DetectStreams,
    Download,
}

impl DownloadPhase {
    pub fn describe(self) -> &'static str {
        match self {
            DownloadPhase::GetStreamUrl => "getting recording stream URL ...",
            DownloadPhase::DetectStreams => "detecting recording audio and video streams ...",
            DownloadPhase::Download => "starting download ...",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    QueueUpdated { queue: Vec<QueueEntry> },
    DownloadStarted { filename: String },
    StateUpdated { state: DownloadPhase, reason: String },
    ProgressUpdated {
        completed: f64,
        elapsed: String,
        remaining: String,
    },
    DownloadErrored { filename: String, reason: String },
}

impl Event {
    pub fn queue_updated(queue: Vec<QueueEntry>) -> Self {
        Event::QueueUpdated { queue }
    }

    pub fn download_started(filename: impl Into<String>) -> Self {
        Event::DownloadStarted {
            filename: filename.into(),
        }
    }

    pub fn state_updated(state: DownloadPhase) -> Self {
        Event::StateUpdated {
            state,
            reason: state.describe().to_string(),
        }
    }

    pub fn progress(sample: &ProgressSample) -> Self {
        Event::ProgressUpdated {
            completed: sample.relative_completed,
            elapsed: format_duration(sample.elapsed),
            remaining: format_duration(sample.remaining),
        }
    }

    pub fn download_errored(filename: impl Into<String>, reason: impl ToString) -> Self {
        Event::DownloadErrored {
            filename: filename.into(),
            reason: reason.to_string(),
        }
    }

    /// Events the hub keeps for observers that connect later.
    pub fn is_replayed(&self) -> bool {
        matches!(
            self,
            Event::QueueUpdated { .. } | Event::DownloadStarted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::progress::REMAINING_UNKNOWN;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn events_serialize_with_a_single_tag() {
        let event = Event::queue_updated(vec![QueueEntry {
            recording_id: 3456,
            output_path: "/tmp/test/my-file.mp4".into(),
        }]);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"queueUpdated": {"queue": [{"recordingId": 3456, "filename": "/tmp/test/my-file.mp4"}]}})
        );

        assert_eq!(
            serde_json::to_value(Event::state_updated(DownloadPhase::GetStreamUrl)).unwrap(),
            json!({"stateUpdated": {"state": "get_stream_url", "reason": "getting recording stream URL ..."}})
        );

        assert_eq!(
            serde_json::to_value(Event::download_errored("/dev/null", "nope")).unwrap(),
            json!({"downloadErrored": {"filename": "/dev/null", "reason": "nope"}})
        );
    }

    #[test]
    fn progress_event_renders_durations() {
        let sample = ProgressSample {
            relative_completed: 0.5,
            elapsed: Duration::from_millis(90_700),
            remaining: Duration::from_secs(90),
        };
        assert_eq!(
            serde_json::to_value(Event::progress(&sample)).unwrap(),
            json!({"progressUpdated": {"completed": 0.5, "elapsed": "1m30s", "remaining": "1m30s"}})
        );

        let starting = ProgressSample {
            relative_completed: 0.0,
            elapsed: Duration::from_secs(1),
            remaining: REMAINING_UNKNOWN,
        };
        match Event::progress(&starting) {
            Event::ProgressUpdated { remaining, .. } => assert_eq!(remaining, "unknown"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn only_queue_and_started_events_are_replayed() {
        assert!(Event::queue_updated(vec![]).is_replayed());
        assert!(Event::download_started("x").is_replayed());
        assert!(!Event::state_updated(DownloadPhase::Download).is_replayed());
        assert!(!Event::download_errored("x", "y").is_replayed());
    }
}
