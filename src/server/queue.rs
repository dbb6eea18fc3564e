//! Pending recordings, worked off one at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{DownloadPhase, Event, QueueEntry};
use super::hub::HubHandle;
use crate::error::{Error, Result};
use crate::ffmpeg::{Downloadable, ProgressSample, ProgressSink, Tools};
use crate::resolver::StreamResolver;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub tools: Tools,
    pub probe_timeout: Duration,
    /// Upper bound for the copy itself. `None` lets ffmpeg run as long as
    /// the source lasts.
    pub download_timeout: Option<Duration>,
    pub tick: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            tools: Tools::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            download_timeout: None,
            tick: DEFAULT_TICK,
        }
    }
}

pub struct DownloadQueue {
    entries: Mutex<Vec<QueueEntry>>,
    /// Held from a list change until its snapshot is handed to the hub, so
    /// snapshots reach observers in the order the list changed.
    publishing: tokio::sync::Mutex<()>,
    hub: HubHandle,
    resolver: Arc<dyn StreamResolver>,
    settings: QueueSettings,
}

impl DownloadQueue {
    pub fn new(hub: HubHandle, resolver: Arc<dyn StreamResolver>, settings: QueueSettings) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            publishing: tokio::sync::Mutex::new(()),
            hub,
            resolver,
            settings,
        }
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().clone()
    }

    pub fn contains(&self, recording_id: i64) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.recording_id == recording_id)
    }

    /// Appends unconditionally. Use [`try_enqueue`](Self::try_enqueue) when
    /// duplicates must be rejected.
    pub async fn enqueue(&self, recording_id: i64, output_path: impl Into<String>) {
        self.push(recording_id, output_path.into(), false).await;
    }

    /// Appends unless the recording is already pending. Returns whether the
    /// entry was added.
    pub async fn try_enqueue(&self, recording_id: i64, output_path: impl Into<String>) -> bool {
        self.push(recording_id, output_path.into(), true).await
    }

    async fn push(&self, recording_id: i64, output_path: String, unique: bool) -> bool {
        let _publishing = self.publishing.lock().await;
        let snapshot = {
            let mut entries = self.entries.lock();
            if unique && entries.iter().any(|entry| entry.recording_id == recording_id) {
                None
            } else {
                entries.push(QueueEntry {
                    recording_id,
                    output_path: output_path.clone(),
                });
                Some(entries.clone())
            }
        };
        match snapshot {
            Some(snapshot) => {
                info!(recording_id, output = %output_path, "queued recording");
                self.hub.publish(Event::queue_updated(snapshot)).await;
                true
            }
            None => {
                debug!(recording_id, "recording already queued");
                false
            }
        }
    }

    /// Drops a pending entry. Returns whether one was removed; only then is
    /// a new snapshot published.
    pub async fn dequeue(&self, recording_id: i64) -> bool {
        let _publishing = self.publishing.lock().await;
        let snapshot = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|entry| entry.recording_id != recording_id);
            (entries.len() != before).then(|| entries.clone())
        };
        match snapshot {
            Some(snapshot) => {
                info!(recording_id, "removed recording from queue");
                self.hub.publish(Event::queue_updated(snapshot)).await;
                true
            }
            None => false,
        }
    }

    /// Removes the head entry and announces it. `None` when the queue is
    /// empty.
    async fn start_head(&self) -> Option<QueueEntry> {
        let _publishing = self.publishing.lock().await;
        let (head, remaining) = {
            let mut entries = self.entries.lock();
            if entries.is_empty() {
                return None;
            }
            let head = entries.remove(0);
            (head, entries.clone())
        };
        self.hub
            .publish(Event::download_started(&head.output_path))
            .await;
        self.hub.publish(Event::queue_updated(remaining)).await;
        Some(head)
    }

    /// Worker loop. Starts the head entry on an idle tick and waits for it
    /// to complete before looking at the queue again. Returns as soon as
    /// `cancel` fires; a running download sees the same token and stops
    /// ffmpeg on its own.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick = self.settings.tick;
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("download queue started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(entry) = self.start_head().await else {
                continue;
            };

            let (done_tx, done_rx) = oneshot::channel();
            let worker = Arc::clone(&self);
            let item_cancel = cancel.clone();
            tokio::spawn(async move {
                worker.download_recording(entry, &item_cancel).await;
                let _ = done_tx.send(());
            });

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = done_rx => {}
            }
            ticker.reset();
        }

        info!("download queue stopped");
    }

    /// Runs one entry to completion. Failures end up as a `downloadErrored`
    /// event and never escape.
    pub async fn download_recording(&self, entry: QueueEntry, cancel: &CancellationToken) {
        match self.process(&entry, cancel).await {
            Ok(()) => info!(recording_id = entry.recording_id, "recording downloaded"),
            Err(err) => {
                warn!(recording_id = entry.recording_id, "download failed: {err}");
                self.hub
                    .publish(Event::download_errored(&entry.output_path, &err))
                    .await;
            }
        }
    }

    async fn process(&self, entry: &QueueEntry, cancel: &CancellationToken) -> Result<()> {
        self.hub
            .publish(Event::state_updated(DownloadPhase::GetStreamUrl))
            .await;
        let url = tokio::select! {
            url = self.resolver.resolve_recording(entry.recording_id) => url?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        debug!(recording_id = entry.recording_id, "got stream URL");

        self.hub
            .publish(Event::state_updated(DownloadPhase::DetectStreams))
            .await;
        let mut downloadable =
            Downloadable::new(url, &entry.output_path, self.settings.tools.clone());
        let limit = self.settings.probe_timeout;
        timeout(limit, downloadable.detect_streams(cancel))
            .await
            .map_err(|_| Error::TimedOut(limit))??;

        self.hub
            .publish(Event::state_updated(DownloadPhase::Download))
            .await;
        let sink: Arc<dyn ProgressSink> = Arc::new(BroadcastProgress::new(
            self.hub.clone(),
            entry.output_path.clone(),
        ));
        match self.settings.download_timeout {
            Some(limit) => timeout(limit, downloadable.download(sink, cancel))
                .await
                .map_err(|_| Error::TimedOut(limit))?,
            None => downloadable.download(sink, cancel).await,
        }
    }
}

/// Publishes every progress sample to the hub. Failures are reported by the
/// queue itself, so `error` only logs.
pub struct BroadcastProgress {
    hub: HubHandle,
    filename: String,
}

impl BroadcastProgress {
    pub fn new(hub: HubHandle, filename: String) -> Self {
        Self { hub, filename }
    }
}

#[async_trait]
impl ProgressSink for BroadcastProgress {
    async fn start(&self) {
        info!(output = %self.filename, "starting download");
    }

    async fn update(&self, sample: ProgressSample) {
        debug!(
            output = %self.filename,
            completed = sample.relative_completed,
            "download progress"
        );
        self.hub.publish(Event::progress(&sample)).await;
    }

    async fn error(&self, err: &Error) {
        warn!(output = %self.filename, "download error: {err}");
    }

    async fn finished(&self) {
        info!(output = %self.filename, "finished download");
    }
}
