//! The long-running side: download queue, event hub and the HTTP front end
//! that feeds and observes them.

pub mod api;
pub mod events;
pub mod hub;
pub mod queue;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::resolver::{RecordingLibrary, StreamResolver};

pub use events::{DownloadPhase, Event, QueueEntry};
pub use hub::{Hub, HubHandle, Subscription};
pub use queue::{BroadcastProgress, DownloadQueue, QueueSettings};

/// Binds the configured address and serves until `cancel` fires.
pub async fn serve(
    config: &RuntimeConfig,
    resolver: Arc<dyn StreamResolver>,
    library: Arc<dyn RecordingLibrary>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    serve_with_listener(listener, config, resolver, library, cancel).await
}

pub async fn serve_with_listener(
    listener: TcpListener,
    config: &RuntimeConfig,
    resolver: Arc<dyn StreamResolver>,
    library: Arc<dyn RecordingLibrary>,
    cancel: CancellationToken,
) -> Result<()> {
    let (hub, handle) = Hub::new();
    let hub_task = tokio::spawn(hub.run(cancel.clone()));

    let queue = Arc::new(DownloadQueue::new(
        handle.clone(),
        resolver,
        config.queue_settings(),
    ));
    let queue_task = tokio::spawn(Arc::clone(&queue).run(cancel.clone()));

    let app = api::router(api::AppState::new(
        queue,
        handle,
        library,
        config.output_dir.clone(),
        config.www_root.clone(),
    ));

    info!(
        "listening on http://{}",
        listener.local_addr().context("reading local address")?
    );
    info!(output_dir = %config.output_dir.display(), "saving recordings");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("running HTTP server");

    // Background loops only stop on cancellation, also when serving failed.
    cancel.cancel();
    let _ = queue_task.await;
    let _ = hub_task.await;
    info!("server shut down");
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::Tools;
    use crate::resolver::tests::{FixedLibrary, FixedResolver, recording};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            output_dir: PathBuf::from("/tmp/test"),
            www_root: None,
            port: 0,
            host: "127.0.0.1".into(),
            api_base_url: "http://127.0.0.1:1".into(),
            session_cookie: None,
            tools: Tools::default(),
            probe_timeout: Duration::from_secs(1),
            download_timeout: None,
        }
    }

    #[tokio::test]
    async fn serves_queue_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let config = config();
        let resolver = Arc::new(FixedResolver(Err("unused".into())));
        let library = Arc::new(FixedLibrary(Ok(vec![recording(
            42,
            "Murot",
            "2026-10-01T21:45:00Z",
        )])));
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move { serve_with_listener(listener, &config, resolver, library, cancel).await }
        });

        let (queue, recordings) = tokio::task::spawn_blocking(move || {
            let fetch = |path: &str| {
                ureq::get(&format!("http://{addr}{path}"))
                    .call()
                    .unwrap()
                    .into_string()
                    .unwrap()
            };
            (fetch("/api/queue"), fetch("/api/recordings"))
        })
        .await
        .unwrap();
        assert_eq!(queue, "[]");
        let recordings: serde_json::Value = serde_json::from_str(&recordings).unwrap();
        assert_eq!(recordings[0]["id"], 42);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}
