//! Talks to the streaming service: turns a recording id into a playable HLS
//! URL and lists the recordings of the account.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://zattoo.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_recording(&self, recording_id: i64) -> Result<String>;
}

/// Lists the recordings stored for the session's account.
#[async_trait]
pub trait RecordingLibrary: Send + Sync {
    async fn list_recordings(&self) -> Result<Vec<Recording>>;
}

/// One entry of the account's recording playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: i64,
    #[serde(default)]
    pub program_id: i64,
    #[serde(default, rename = "cid")]
    pub channel_id: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub episode_title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Recording {
    /// A recording can only be downloaded once its programme has ended.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    /// One line for console listings, e.g. `Tatort - Murot (ard/hd) (ID 42)`.
    pub fn describe(&self) -> String {
        if self.episode_title.is_empty() {
            format!(
                "{} ({}/{}) (ID {})",
                self.title, self.channel_id, self.level, self.id
            )
        } else {
            format!(
                "{} - {} ({}/{}) (ID {})",
                self.title, self.episode_title, self.channel_id, self.level, self.id
            )
        }
    }
}

/// Recordings whose programme has ended by `now`, in playlist order.
pub fn ready_recordings(recordings: &[Recording], now: DateTime<Utc>) -> Vec<&Recording> {
    recordings
        .iter()
        .filter(|recording| recording.is_ready(now))
        .collect()
}

#[derive(Debug, Deserialize)]
struct PlaylistResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    recordings: Vec<Recording>,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(default)]
    success: bool,
    stream: Option<WatchStream>,
}

#[derive(Debug, Deserialize)]
struct WatchStream {
    #[serde(default)]
    url: String,
}

/// Asks the watch endpoint of the streaming service for the recording's URL,
/// authenticated by an already established session cookie.
#[derive(Clone)]
pub struct WatchUrlResolver {
    agent: ureq::Agent,
    base_url: String,
    session_cookie: Option<String>,
}

impl WatchUrlResolver {
    pub fn new(base_url: impl Into<String>, session_cookie: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_cookie,
        }
    }

    pub fn watch_url(&self, recording_id: i64) -> String {
        format!("{}/zapi/watch/recording/{recording_id}", self.base_url)
    }

    pub fn playlist_url(&self) -> String {
        format!("{}/zapi/v2/playlist", self.base_url)
    }

    fn list_blocking(&self) -> Result<Vec<Recording>> {
        let mut request = self.agent.get(&self.playlist_url());
        if let Some(cookie) = &self.session_cookie {
            request = request.set("Cookie", cookie);
        }

        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                Error::listing(format!("failed to get playlist with status {code}"))
            }
            ureq::Error::Transport(transport) => {
                Error::listing(format!("failed to get playlist: {transport}"))
            }
        })?;

        let body: PlaylistResponse = response
            .into_json()
            .map_err(|err| Error::listing(format!("failed to decode playlist: {err}")))?;
        if !body.success {
            return Err(Error::listing("failed to fetch playlist"));
        }
        debug!(count = body.recordings.len(), "fetched recording playlist");
        Ok(body.recordings)
    }

    fn resolve_blocking(&self, recording_id: i64) -> Result<String> {
        let url = self.watch_url(recording_id);
        let mut request = self.agent.post(&url);
        if let Some(cookie) = &self.session_cookie {
            request = request.set("Cookie", cookie);
        }

        let response = request
            .send_form(&[
                ("with_schedule", "false"),
                ("stream_type", "hls7"),
                ("https_watch_urls", "true"),
                ("sdh_subtitles", "true"),
            ])
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    Error::resolution(format!("failed to get recording with status {code}"))
                }
                ureq::Error::Transport(transport) => {
                    Error::resolution(format!("failed to get recording: {transport}"))
                }
            })?;

        let body: WatchResponse = response
            .into_json()
            .map_err(|err| Error::resolution(format!("failed to decode watch response: {err}")))?;
        if !body.success {
            return Err(Error::resolution("watch request was not successful"));
        }
        match body.stream {
            Some(stream) if !stream.url.is_empty() => {
                debug!(recording_id, "resolved recording stream URL");
                Ok(stream.url)
            }
            _ => Err(Error::resolution("watch response did not contain a stream URL")),
        }
    }
}

#[async_trait]
impl StreamResolver for WatchUrlResolver {
    async fn resolve_recording(&self, recording_id: i64) -> Result<String> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.resolve_blocking(recording_id))
            .await
            .map_err(|err| Error::resolution(format!("resolver task failed: {err}")))?
    }
}

#[async_trait]
impl RecordingLibrary for WatchUrlResolver {
    async fn list_recordings(&self) -> Result<Vec<Recording>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.list_blocking())
            .await
            .map_err(|err| Error::listing(format!("playlist task failed: {err}")))?
    }
}
