//! The Callback Endpoint: an HTTP listener exposed to in-container
//! workloads, translating subjob-submit/provenance-read/output-stash
//! requests into [`QueueEvent`]s and replying from [`CallbackReply`]s
//! (`spec.md` §4.5).
//!
//! Runs as its own task so a slow supervisor RPC never stalls the HTTP
//! server a workload is hitting (`spec.md` §9). Grounded in the teacher's
//! `axum` router/handler shape (`server/router.rs`, `server/api/workflows.rs`,
//! `server/api/error.rs`), adapted from a REST resource surface to this
//! spec's single JSON-RPC-shaped endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::JobParams;
use crate::supervisor::CallbackReply;
use crate::supervisor::QueueEvent;
use crate::supervisor::SharedProvenance;

/// Upper bound on how long a handler waits for its matching reply before
/// giving up; not itself part of the supervisor's contract (every accepted
/// `Submit` eventually produces a `Finished*`), but callers need a bounded
/// HTTP response even if that invariant is somehow violated upstream.
const REPLY_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Shared state for the callback router.
#[derive(Clone)]
pub struct CallbackState {
    /// Sender for events the endpoint injects into the supervisor's
    /// inbound queue.
    pub inbound: Sender<QueueEvent>,
    /// The supervisor's outbound reply broadcaster; handlers subscribe
    /// fresh per request and filter for their own correlation id.
    pub outbound: broadcast::Sender<CallbackReply>,
    /// Shared, read-mostly provenance handle.
    pub provenance: SharedProvenance,
    /// The token callers must present.
    pub token: String,
}

/// A single JSON-RPC-shaped request body.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Error response shape, matching the teacher's `ErrorResponse`.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Errors the callback endpoint can report to a caller.
#[derive(Debug, thiserror::Error)]
enum CallbackError {
    /// The caller's token did not match.
    #[error("unauthorized")]
    Unauthorized,
    /// The request named an unrecognized method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    /// The request's `params` didn't match the expected shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The supervisor's inbound queue is gone.
    #[error("supervisor is no longer accepting events")]
    SupervisorGone,
    /// No matching reply arrived before the wait timed out.
    #[error("timed out waiting for a reply")]
    Timeout,
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UnknownMethod(_) | Self::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Self::SupervisorGone | Self::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// Builds the callback router.
fn create_router(state: CallbackState) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .with_state(Arc::new(state))
}

/// Binds `listener` and serves the callback protocol until `cancel` fires.
pub fn spawn(
    listener: tokio::net::TcpListener,
    state: CallbackState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let app = create_router(state);
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
        if let Err(err) = server.await {
            tracing::warn!(error = %err, "callback endpoint exited with an error");
        }
    })
}

/// Dispatches one JSON-RPC-shaped request.
async fn handle_rpc(
    State(state): State<Arc<CallbackState>>,
    headers: HeaderMap,
    Json(request): Json<RpcRequest>,
) -> Result<Json<Value>, CallbackError> {
    let presented = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != state.token {
        return Err(CallbackError::Unauthorized);
    }

    match request.method.as_str() {
        "submit_subjob" => submit_subjob(&state, request.params).await,
        "get_provenance" => get_provenance(&state).await,
        "stash_output" => stash_output(&state, request.params).await,
        other => Err(CallbackError::UnknownMethod(other.to_string())),
    }
}

/// `submit subjob`: injects a `Submit` event with a freshly generated id
/// and blocks for the matching `Output` reply.
async fn submit_subjob(state: &CallbackState, params: Value) -> Result<Json<Value>, CallbackError> {
    let job_params: JobParams = serde_json::from_value(params)
        .map_err(|err| CallbackError::InvalidParams(err.to_string()))?;
    let job_id = Uuid::new_v4().to_string();

    let mut replies = state.outbound.subscribe();
    state
        .inbound
        .send(QueueEvent::Submit {
            job_id: job_id.clone(),
            params: job_params,
        })
        .await
        .map_err(|_| CallbackError::SupervisorGone)?;

    let document = wait_for_output(&mut replies, &job_id).await?;
    Ok(Json(serde_json::json!({"result": document})))
}

/// `get provenance`: reads the shared snapshot directly. The fixed
/// `QueueEvent` shape has no "request provenance" variant, so this bypasses
/// the inbound/outbound round trip described for the other two methods;
/// snapshot reads never mutate supervisor state, so reading the shared
/// handle directly is equivalent and simpler.
async fn get_provenance(state: &CallbackState) -> Result<Json<Value>, CallbackError> {
    let snapshot = state.provenance.read().await.snapshot();
    // Broadcast for parity with the documented wire shape, even though this
    // handler already has its answer; no other subscriber currently waits
    // on a `Provenance` reply.
    let _ = state.outbound.send(CallbackReply::Provenance(snapshot.clone()));
    Ok(Json(serde_json::json!({"result": snapshot})))
}

/// `stash output`: posts a `FinishedSpecial` event and replies immediately;
/// the special runtime path is responsible for the event's eventual
/// delivery, not this handler's caller.
async fn stash_output(state: &CallbackState, params: Value) -> Result<Json<Value>, CallbackError> {
    #[derive(Deserialize)]
    struct StashParams {
        job_id: String,
        payload: Value,
    }

    let stash: StashParams =
        serde_json::from_value(params).map_err(|err| CallbackError::InvalidParams(err.to_string()))?;

    state
        .inbound
        .send(QueueEvent::FinishedSpecial {
            job_id: stash.job_id,
            payload: stash.payload,
        })
        .await
        .map_err(|_| CallbackError::SupervisorGone)?;

    Ok(Json(serde_json::json!({"result": true})))
}

/// Blocks on `replies` until an `Output` for `job_id` arrives, or times out.
async fn wait_for_output(
    replies: &mut broadcast::Receiver<CallbackReply>,
    job_id: &str,
) -> Result<Value, CallbackError> {
    tokio::time::timeout(REPLY_WAIT_TIMEOUT, async move {
        loop {
            match replies.recv().await {
                Ok(CallbackReply::Output { job_id: id, document }) if id == job_id => {
                    return Ok(document);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CallbackError::SupervisorGone);
                }
            }
        }
    })
    .await
    .map_err(|_| CallbackError::Timeout)?
}
