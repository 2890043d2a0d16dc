//! HTTP surface: enqueue, poll, WebSocket push and folder listings.
//!
//! | route | response |
//! |-------|----------|
//! | `POST /api/jobs` | `202 {"job_id": …}` or `400 {"error": code}` |
//! | `GET /api/jobs/{id}` | job snapshot, or `404 {"error": "job_not_found"}` |
//! | `GET /api/jobs/{id}/ws` | snapshot stream until the job is terminal |
//! | `GET /api/folders?refresh=bool` | `{"folders": [...]}` for the caller's identity |
//! | `GET /healthz` | `ok` |
//!
//! The push stream is latest-wins: the store may drop updates for a slow
//! socket, so the socket task also re-reads the job once a second and
//! never misses the terminal state.

use crate::error::ErrorCode;
use crate::folders::{FolderCache, FolderError, DEFAULT_IDENTITY};
use crate::job::{Job, JobId};
use crate::pipeline::Pipeline;
use crate::request::DeliveryRequest;
use crate::store::JobStore;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Header carrying the caller's identity for folder listings.
pub const IDENTITY_HEADER: &str = "x-paperdrop-identity";

/// Fallback poll period of the WebSocket push loop.
const WS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state of every handler.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub folders: Arc<FolderCache>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, folders: Arc<FolderCache>) -> Arc<Self> {
        Arc::new(Self { pipeline, folders })
    }
}

/// `{"error": code}` with a status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str) -> Self {
        Self { status, code }
    }

    fn from_code(code: ErrorCode) -> Self {
        let status = match code {
            ErrorCode::JobNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, code.as_str())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.code }))).into_response()
    }
}

impl From<FolderError> for ApiError {
    fn from(e: FolderError) -> Self {
        match e {
            FolderError::UnknownIdentity(_) => Self::new(StatusCode::NOT_FOUND, "unknown_identity"),
            FolderError::Remote(e) => {
                warn!("Folder listing failed: {}", e);
                Self::new(StatusCode::BAD_GATEWAY, ErrorCode::InternalError.as_str())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FoldersResponse {
    pub folders: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FolderQuery {
    #[serde(default)]
    refresh: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", post(enqueue))
        .route("/api/jobs/{id}", get(poll_job))
        .route("/api/jobs/{id}/ws", get(job_socket))
        .route("/api/folders", get(list_folders))
        .with_state(state)
}

/// Serve the router on `listener` until the process stops.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    axum::serve(listener, router(state)).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeliveryRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let job_id = state
        .pipeline
        .enqueue(request)
        .await
        .map_err(ApiError::from_code)?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

async fn poll_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .pipeline
        .store()
        .get(&JobId::from(id))
        .map(Json)
        .ok_or_else(|| ApiError::from_code(ErrorCode::JobNotFound))
}

async fn job_socket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        push_job(socket, state.pipeline.store(), &JobId::from(id)).await
    })
}

/// Stream snapshots of `id` over `socket` until the job is terminal, then
/// close. An unknown id gets a single `job_not_found` frame.
pub async fn push_job<S, E>(mut socket: S, store: &Arc<JobStore>, id: &JobId)
where
    S: Sink<Message> + Stream<Item = Result<Message, E>> + Unpin,
{
    let mut sub = store.subscribe(id);

    if store.get(id).is_none() {
        let frame = json!({ "error": ErrorCode::JobNotFound.as_str() }).to_string();
        let _ = socket.send(Message::Text(frame.into())).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let mut poll = tokio::time::interval(WS_POLL_INTERVAL);
    let mut last_sent: Option<Job> = None;
    loop {
        let job = tokio::select! {
            pushed = sub.recv() => match pushed {
                Some(job) => job,
                None => break,
            },
            _ = poll.tick() => match store.get(id) {
                Some(job) => job,
                None => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!(job = %id, "socket closed by peer");
                    return;
                }
                Some(Ok(_)) => continue,
            },
        };

        if last_sent.as_ref() != Some(&job) {
            let frame = match serde_json::to_string(&job) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(job = %id, "Failed to encode snapshot: {}", e);
                    break;
                }
            };
            if socket.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        let terminal = job.status.is_terminal();
        last_sent = Some(job);
        if terminal {
            break;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn list_folders(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FolderQuery>,
) -> Result<Json<FoldersResponse>, ApiError> {
    let identity = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_IDENTITY);
    let folders = state.folders.get(identity, query.refresh).await?;
    Ok(Json(FoldersResponse { folders }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, Operation};
    use axum::body::to_bytes;
    use futures::channel::mpsc;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Socket stand-in: frames sent go to `out`, frames read come from `incoming`.
    struct ChannelSocket {
        out: mpsc::UnboundedSender<Message>,
        incoming: mpsc::UnboundedReceiver<Result<Message, Infallible>>,
    }

    impl Sink<Message> for ChannelSocket {
        type Error = mpsc::SendError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.out).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            Pin::new(&mut self.out).start_send(item)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.out).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.out).poll_close(cx)
        }
    }

    impl Stream for ChannelSocket {
        type Item = Result<Message, Infallible>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx)
        }
    }

    type Peer = (
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedSender<Result<Message, Infallible>>,
    );

    fn socket_pair() -> (ChannelSocket, Peer) {
        let (out, sent) = mpsc::unbounded();
        let (peer, incoming) = mpsc::unbounded();
        (ChannelSocket { out, incoming }, (sent, peer))
    }

    fn text_of(frame: &Message) -> &str {
        match frame {
            Message::Text(text) => text.as_str(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_job_gets_one_error_frame_then_close() {
        let store = JobStore::new();
        let (socket, (sent, _peer)) = socket_pair();

        push_job(socket, &store, &JobId::from("missing")).await;

        let frames: Vec<Message> = sent.collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(text_of(&frames[0]), r#"{"error":"job_not_found"}"#);
        assert!(matches!(frames[1], Message::Close(None)));
    }

    #[tokio::test]
    async fn pushes_snapshots_until_terminal_then_closes() {
        let store = JobStore::new();
        let id = JobId::from("ws-job");
        store.create(&id);
        let (socket, (sent, _peer)) = socket_pair();

        let push = tokio::spawn({
            let store = Arc::clone(&store);
            let id = id.clone();
            async move { push_job(socket, &store, &id).await }
        });
        tokio::task::yield_now().await;
        store.update_stage(&id, Operation::Uploading);
        store.update_progress(&id, 50);
        store.update(&id, JobStatus::Success, "done", None);
        push.await.unwrap();

        let frames: Vec<Message> = sent.collect().await;
        let (close, snapshots) = frames.split_last().unwrap();
        assert!(matches!(close, Message::Close(None)));
        let jobs: Vec<Job> = snapshots
            .iter()
            .map(|f| serde_json::from_str(text_of(f)).unwrap())
            .collect();
        assert!(!jobs.is_empty());
        assert!(jobs[..jobs.len() - 1].iter().all(|j| !j.status.is_terminal()));
        assert_eq!(jobs.last().unwrap().status, JobStatus::Success);
        assert!(jobs.windows(2).all(|w| w[0] != w[1]), "duplicate snapshot sent");
    }

    #[tokio::test]
    async fn peer_close_ends_the_stream() {
        let store = JobStore::new();
        let id = JobId::from("ws-job");
        store.create(&id);
        let (socket, (sent, peer)) = socket_pair();
        peer.unbounded_send(Ok(Message::Close(None))).unwrap();

        tokio::time::timeout(Duration::from_secs(5), push_job(socket, &store, &id))
            .await
            .expect("push loop kept running after close");
        let frames: Vec<Message> = sent.collect().await;
        assert!(frames.iter().all(|f| !matches!(f, Message::Close(_))));
    }

    #[tokio::test]
    async fn api_error_body_is_code_only() {
        let resp = ApiError::from_code(ErrorCode::DecodeError).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"decode_error"}"#);
    }

    #[test]
    fn status_per_code() {
        assert_eq!(
            ApiError::from_code(ErrorCode::JobNotFound).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from_code(ErrorCode::InvalidPrefix).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(FolderError::UnknownIdentity("x".into())).status,
            StatusCode::NOT_FOUND
        );
    }
}
