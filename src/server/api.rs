//! HTTP and WebSocket front end of the download queue.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::{
        Path as AxumPath, Request, State,
        rejection::FormRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    fs::File,
    time::{Instant, interval_at, sleep, timeout},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::events::QueueEntry;
use crate::resolver::{Recording, RecordingLibrary};
use super::hub::HubHandle;
use super::queue::DownloadQueue;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Clone)]
pub struct AppState {
    queue: Arc<DownloadQueue>,
    hub: HubHandle,
    library: Arc<dyn RecordingLibrary>,
    output_dir: Arc<PathBuf>,
    www_root: Option<Arc<PathBuf>>,
}

impl AppState {
    pub fn new(
        queue: Arc<DownloadQueue>,
        hub: HubHandle,
        library: Arc<dyn RecordingLibrary>,
        output_dir: PathBuf,
        www_root: Option<PathBuf>,
    ) -> Self {
        Self {
            queue,
            hub,
            library,
            output_dir: Arc::new(output_dir),
            www_root: www_root.map(Arc::new),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: Option<String>,
}

impl ApiError {
    fn bad_request(code: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            detail: None,
        }
    }

    fn conflict(code: &'static str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code,
            detail: None,
        }
    }

    fn internal(code: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code,
            detail: None,
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.detail {
            Some(detail) => json!({ "code": self.code, "err": detail }),
            None => json!({ "code": self.code }),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/recordings", get(list_recordings))
        .route("/api/recordings/{recording_id}/enqueue", post(enqueue))
        .route("/api/recordings/{recording_id}/dequeue", post(dequeue))
        .route("/api/queue", get(list_queue))
        .route("/api/queue/events", get(queue_events))
        .fallback(static_file)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    info!(
        duration = ?started.elapsed(),
        status = response.status().as_u16(),
        %method,
        %uri,
        "handled request"
    );
    response
}

fn parse_recording_id(raw: &str) -> ApiResult<i64> {
    raw.parse().map_err(|err: std::num::ParseIntError| {
        ApiError::bad_request("error_parsing_recordingId").with_detail(err.to_string())
    })
}

/// Only bare names are accepted so the output stays inside the output
/// directory.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[derive(Debug, Deserialize)]
struct EnqueueForm {
    filename: Option<String>,
}

async fn enqueue(
    State(state): State<AppState>,
    AxumPath(raw_id): AxumPath<String>,
    form: Result<Form<EnqueueForm>, FormRejection>,
) -> ApiResult<Json<Value>> {
    let recording_id = parse_recording_id(&raw_id)?;
    let Form(form) = form
        .map_err(|err| ApiError::bad_request("error_parsing_body").with_detail(err.body_text()))?;
    let filename = form
        .filename
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing_filename"))?;
    if !is_plain_file_name(&filename) {
        return Err(ApiError::bad_request("invalid_filename"));
    }

    let output_path = state.output_dir.join(&filename);
    let queued = state
        .queue
        .try_enqueue(recording_id, output_path.to_string_lossy().into_owned())
        .await;
    if !queued {
        return Err(ApiError::conflict("already_queued"));
    }
    Ok(Json(json!({ "result": true })))
}

async fn dequeue(
    State(state): State<AppState>,
    AxumPath(raw_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let recording_id = parse_recording_id(&raw_id)?;
    let removed = state.queue.dequeue(recording_id).await;
    Ok(Json(json!({ "result": removed })))
}

async fn list_recordings(State(state): State<AppState>) -> ApiResult<Json<Vec<Recording>>> {
    let recordings = state.library.list_recordings().await.map_err(|err| {
        warn!("failed to list recordings: {err}");
        ApiError::internal("error_listing_recordings").with_detail(err.to_string())
    })?;
    Ok(Json(recordings))
}

async fn list_queue(State(state): State<AppState>) -> Json<Vec<QueueEntry>> {
    Json(state.queue.snapshot())
}

async fn queue_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn send_with_timeout(sender: &mut SplitSink<WebSocket, Message>, message: Message) -> bool {
    matches!(timeout(WRITE_TIMEOUT, sender.send(message)).await, Ok(Ok(())))
}

/// Pushes hub events to one client until either side goes away or the
/// client stays silent for longer than [`PONG_TIMEOUT`].
async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let Some(mut subscription) = hub.subscribe().await else {
        return;
    };
    let listener = subscription.id;
    debug!(listener, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    let inactivity = sleep(PONG_TIMEOUT);
    tokio::pin!(inactivity);

    loop {
        tokio::select! {
            event = subscription.events.recv() => {
                // The hub closes the channel when it drops a slow listener.
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(listener, "failed to encode event: {err}");
                        continue;
                    }
                };
                if !send_with_timeout(&mut sender, Message::Text(text.into())).await {
                    break;
                }
            }
            _ = ping.tick() => {
                if !send_with_timeout(&mut sender, Message::Ping(Bytes::new())).await {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => inactivity.as_mut().reset(Instant::now() + PONG_TIMEOUT),
            },
            _ = &mut inactivity => {
                debug!(listener, "websocket inactive");
                break;
            }
        }
    }

    hub.unsubscribe(listener).await;
    debug!(listener, "websocket disconnected");
}

async fn static_file(State(state): State<AppState>, uri: Uri) -> ApiResult<Response> {
    let root = state.www_root.as_deref().ok_or_else(ApiError::not_found)?;
    let mut relative = uri.path().trim_start_matches('/').to_string();
    if relative.is_empty() || relative.ends_with('/') {
        relative.push_str("index.html");
    }
    let relative = Path::new(&relative);
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found());
    }
    stream_file(root.join(relative)).await
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path).await.map_err(|_| ApiError::not_found())?;

    let guessed = MimeGuess::from_path(&path).first();
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    let mut response = body.into_response();
    if let Some(mime) = guessed {
        if let Ok(value) = mime.to_string().parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::{FixedLibrary, FixedResolver, recording};
    use crate::server::events::Event;
    use crate::server::hub::{Hub, Subscription};
    use crate::server::queue::QueueSettings;
    use axum::body::to_bytes;
    use axum::http::Method;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        queue: Arc<DownloadQueue>,
        hub: HubHandle,
        events: Subscription,
        cancel: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn fixture(www_root: Option<PathBuf>) -> Fixture {
        fixture_with_library(www_root, FixedLibrary(Ok(Vec::new()))).await
    }

    async fn fixture_with_library(www_root: Option<PathBuf>, library: FixedLibrary) -> Fixture {
        let (hub, handle) = Hub::new();
        let cancel = CancellationToken::new();
        tokio::spawn(hub.run(cancel.clone()));
        let events = handle.subscribe_with_capacity(256).await.unwrap();
        let resolver = Arc::new(FixedResolver(Err("unused".into())));
        let queue = Arc::new(DownloadQueue::new(
            handle.clone(),
            resolver,
            QueueSettings::default(),
        ));
        let state = AppState::new(
            queue.clone(),
            handle.clone(),
            Arc::new(library),
            PathBuf::from("/tmp/test"),
            www_root,
        );
        Fixture {
            app: router(state),
            queue,
            hub: handle,
            events,
            cancel,
        }
    }

    fn post_form(uri: &str, content_type: &str, body: &'static str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn call(app: &Router, request: Request) -> (StatusCode, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        (status, to_bytes(response.into_body(), usize::MAX).await.unwrap())
    }

    async fn call_json(app: &Router, request: Request) -> (StatusCode, Value) {
        let (status, body) = call(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    const FORM: &str = "application/x-www-form-urlencoded";

    #[tokio::test]
    async fn enqueue_rejects_malformed_recording_id() {
        let f = fixture(None).await;
        let (status, body) = call_json(
            &f.app,
            post_form("/api/recordings/not-an-int/enqueue", FORM, "filename=a.mp4"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"code": "error_parsing_recordingId", "err": "invalid digit found in string"})
        );
    }

    #[tokio::test]
    async fn enqueue_rejects_non_form_body() {
        let f = fixture(None).await;
        let (status, body) = call_json(
            &f.app,
            post_form("/api/recordings/1234/enqueue", "application/json", ""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "error_parsing_body");
        assert!(body["err"].is_string());
    }

    #[tokio::test]
    async fn enqueue_requires_filename() {
        let f = fixture(None).await;
        let (status, body) =
            call_json(&f.app, post_form("/api/recordings/2345/enqueue", FORM, "foo")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"code": "missing_filename"}));
        assert!(f.queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn enqueue_rejects_paths() {
        let f = fixture(None).await;
        for body in ["filename=..%2Fescape.mp4", "filename=%2Fetc%2Fpasswd", "filename=.."] {
            let (status, json) =
                call_json(&f.app, post_form("/api/recordings/1/enqueue", FORM, body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(json, json!({"code": "invalid_filename"}));
        }
    }

    #[tokio::test]
    async fn enqueue_queues_under_output_dir_and_publishes() {
        let mut f = fixture(None).await;
        let (status, body) = call_json(
            &f.app,
            post_form("/api/recordings/3456/enqueue", FORM, "filename=my-file.mp4"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": true}));

        let expected = vec![QueueEntry {
            recording_id: 3456,
            output_path: "/tmp/test/my-file.mp4".into(),
        }];
        assert_eq!(f.queue.snapshot(), expected);
        assert_eq!(
            f.events.events.recv().await,
            Some(Event::queue_updated(expected.clone()))
        );

        let (status, body) = call_json(
            &f.app,
            post_form("/api/recordings/3456/enqueue", FORM, "filename=again.mp4"),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({"code": "already_queued"}));

        let (status, body) = call_json(&f.app, get("/api/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{"recordingId": 3456, "filename": "/tmp/test/my-file.mp4"}])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_of_one_recording_conflict() {
        let f = fixture(None).await;
        let requests = (0..8).map(|n| {
            let app = f.app.clone();
            tokio::spawn(async move {
                let body = format!("filename=copy-{n}.mp4");
                let request = Request::builder()
                    .method(Method::POST)
                    .uri("/api/recordings/3456/enqueue")
                    .header(header::CONTENT_TYPE, FORM)
                    .body(Body::from(body))
                    .unwrap();
                app.oneshot(request).await.unwrap().status()
            })
        });
        let mut statuses = Vec::new();
        for request in requests.collect::<Vec<_>>() {
            statuses.push(request.await.unwrap());
        }

        assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1);
        assert_eq!(
            statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count(),
            7
        );
        assert_eq!(f.queue.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn recordings_are_listed_from_library() {
        let library = FixedLibrary(Ok(vec![
            recording(42, "Murot", "2026-10-01T21:45:00Z"),
            recording(43, "", "2099-01-01T00:00:00Z"),
        ]));
        let f = fixture_with_library(None, library).await;
        let (status, body) = call_json(&f.app, get("/api/recordings")).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<i64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|recording| recording["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![42, 43]);
        assert_eq!(body[0]["episode_title"], "Murot");
        assert_eq!(body[0]["cid"], "ard");
    }

    #[tokio::test]
    async fn recording_list_failure_is_internal_error() {
        let library = FixedLibrary(Err("failed to get playlist with status 456".into()));
        let f = fixture_with_library(None, library).await;
        let (status, body) = call_json(&f.app, get("/api/recordings")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({"code": "error_listing_recordings", "err": "failed to get playlist with status 456"})
        );
    }

    #[tokio::test]
    async fn dequeue_reports_whether_entry_was_removed() {
        let f = fixture(None).await;
        f.queue.enqueue(10, "/tmp/test/a.mp4").await;

        let (status, body) =
            call_json(&f.app, post_form("/api/recordings/10/dequeue", FORM, "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"result": true}));

        let (_, body) = call_json(&f.app, post_form("/api/recordings/10/dequeue", FORM, "")).await;
        assert_eq!(body, json!({"result": false}));

        let (status, _) = call_json(&f.app, post_form("/api/recordings/x/dequeue", FORM, "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn static_files_are_served_from_www_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>hi</html>").unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        let f = fixture(Some(dir.path().to_path_buf())).await;

        let response = f.app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<html>hi</html>");

        let response = f.app.clone().oneshot(get("/assets/app.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .contains("javascript")
        );

        let (status, _) = call(&f.app, get("/missing.css")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&f.app, get("/assets/../../etc/passwd")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn without_www_root_unknown_paths_are_not_found() {
        let f = fixture(None).await;
        let (status, body) = call_json(&f.app, get("/index.html")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"code": "not_found"}));
    }

    #[tokio::test]
    async fn events_endpoint_requires_upgrade() {
        let f = fixture(None).await;
        let (status, _) = call(&f.app, get("/api/queue/events")).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn websocket_streams_events_as_json() {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let f = fixture(None).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = f.app.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/queue/events"))
            .await
            .unwrap();

        // Delivered live or replayed on registration, exactly once either way.
        f.queue.enqueue(3456, "/tmp/test/my-file.mp4").await;
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Text(text) = message else {
            panic!("expected a text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"queueUpdated": {"queue": [{"recordingId": 3456, "filename": "/tmp/test/my-file.mp4"}]}})
        );

        f.hub.publish(Event::download_started("/tmp/test/my-file.mp4")).await;
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            message.into_text().unwrap().as_str(),
            r#"{"downloadStarted":{"filename":"/tmp/test/my-file.mp4"}}"#
        );
    }

    #[test]
    fn plain_file_names_only() {
        assert!(is_plain_file_name("my-file.mp4"));
        assert!(!is_plain_file_name("dir/my-file.mp4"));
        assert!(!is_plain_file_name("../my-file.mp4"));
        assert!(!is_plain_file_name("/my-file.mp4"));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(""));
    }
}
