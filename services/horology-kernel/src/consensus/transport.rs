use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{
    AppendRequest, AppendResponse, ConsensusCoordinator, ReadIndexRequest, ReadIndexResponse,
    VoteRequest, VoteResponse,
};

#[derive(Clone)]
struct TransportState {
    coordinator: ConsensusCoordinator,
}

/// Serve the replica-set RPC surface. Routes mirror the coordinator handlers
/// one-to-one; the transport adds nothing but JSON framing.
pub(crate) fn spawn_server(
    coordinator: ConsensusCoordinator,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let app = Router::new()
        .route("/consensus/vote", post(handle_vote))
        .route("/consensus/append", post(handle_append))
        .route("/consensus/read-index", post(handle_read_index))
        .with_state(TransportState { coordinator });

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
        {
            warn!(?error, "consensus transport exited with error");
        }
    })
}

async fn handle_vote(
    State(state): State<TransportState>,
    Json(request): Json<VoteRequest>,
) -> Json<VoteResponse> {
    Json(state.coordinator.handle_vote(request).await)
}

async fn handle_append(
    State(state): State<TransportState>,
    Json(request): Json<AppendRequest>,
) -> Json<AppendResponse> {
    Json(state.coordinator.handle_append(request).await)
}

async fn handle_read_index(
    State(state): State<TransportState>,
    Json(request): Json<ReadIndexRequest>,
) -> Json<ReadIndexResponse> {
    Json(state.coordinator.handle_read_index(request).await)
}

pub(crate) async fn post_vote(
    client: &reqwest::Client,
    base_url: &str,
    request: &VoteRequest,
) -> Option<VoteResponse> {
    post_json(client, base_url, "/consensus/vote", request).await
}

pub(crate) async fn post_append(
    client: &reqwest::Client,
    base_url: &str,
    request: &AppendRequest,
) -> Option<AppendResponse> {
    post_json(client, base_url, "/consensus/append", request).await
}

pub(crate) async fn post_read_index(
    client: &reqwest::Client,
    base_url: &str,
    request: &ReadIndexRequest,
) -> Option<ReadIndexResponse> {
    post_json(client, base_url, "/consensus/read-index", request).await
}

/// Unreachable peers resolve to `None`; the caller treats that as a missing
/// acknowledgement rather than an error.
async fn post_json<Req, Resp>(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    request: &Req,
) -> Option<Resp>
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let url = format!("{base_url}{path}");
    let response = client.post(&url).json(request).send().await.ok()?;
    let response = response.error_for_status().ok()?;
    response.json().await.ok()
}
