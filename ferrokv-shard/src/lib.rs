//! The shard node's axum HTTP surface (§4.7), the registrar background task
//! (§4.6), and the replication worker (§4.5).
//!
//! `WalManager` (from `ferrokv-storage`) is the only piece of durable state;
//! everything here is either routing requests to it or keeping a follower's
//! copy converging with its leader's.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ferrokv_core::{HealthResponse, Op, Role, StorageReadResponse, StorageWriteRequest, StorageWriteResponse};
use ferrokv_storage::{StorageError, WalManager};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("this node is not the leader for this shard")]
    RoleMismatch,

    #[error("key not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for ShardError {
    fn into_response(self) -> Response {
        let status = match &self {
            ShardError::RoleMismatch => StatusCode::BAD_REQUEST,
            ShardError::NotFound => StatusCode::NOT_FOUND,
            ShardError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// A shard node's role is fixed for the lifetime of the process; it only
/// changes across a restart, by reading config fresh.
#[derive(Clone)]
pub struct ShardState {
    pub shard_id: String,
    pub role: Role,
    pub wal: Arc<WalManager>,
}

impl ShardState {
    pub fn new(shard_id: impl Into<String>, role: Role, wal: Arc<WalManager>) -> Self {
        Self {
            shard_id: shard_id.into(),
            role,
            wal,
        }
    }

    fn require_leader(&self) -> Result<(), ShardError> {
        match self.role {
            Role::Leader => Ok(()),
            Role::Follower => Err(ShardError::RoleMismatch),
        }
    }
}

pub fn build_router(state: ShardState) -> Router {
    Router::new()
        .route(
            "/storage/:key",
            axum::routing::post(write_storage)
                .get(read_storage)
                .delete(delete_storage)
                .head(head_storage),
        )
        .route("/replication/log", get(replication_log))
        .route("/health", get(health))
        .with_state(state)
}

async fn write_storage(
    AxumPath(key): AxumPath<String>,
    State(state): State<ShardState>,
    Json(req): Json<StorageWriteRequest>,
) -> Result<Json<StorageWriteResponse>, ShardError> {
    state.require_leader()?;
    let entry = state.wal.append(key, Some(req.value), Op::Put).await?;
    Ok(Json(StorageWriteResponse {
        status: "committed".into(),
        offset: entry.offset,
    }))
}

async fn read_storage(
    AxumPath(key): AxumPath<String>,
    State(state): State<ShardState>,
) -> Result<Json<StorageReadResponse>, ShardError> {
    match state.wal.get(&key) {
        Some(record) => Ok(Json(StorageReadResponse {
            value: record.value,
            version: record.version,
        })),
        None => Err(ShardError::NotFound),
    }
}

async fn delete_storage(
    AxumPath(key): AxumPath<String>,
    State(state): State<ShardState>,
) -> Result<Json<StorageWriteResponse>, ShardError> {
    state.require_leader()?;
    let entry = state.wal.append(key, None, Op::Delete).await?;
    Ok(Json(StorageWriteResponse {
        status: "deleted".into(),
        offset: entry.offset,
    }))
}

async fn head_storage(
    AxumPath(key): AxumPath<String>,
    State(state): State<ShardState>,
) -> StatusCode {
    if state.wal.get(&key).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct ReplicationQuery {
    start_offset: u64,
}

async fn replication_log(
    State(state): State<ShardState>,
    Query(query): Query<ReplicationQuery>,
) -> Json<Vec<ferrokv_core::WalEntry>> {
    Json(state.wal.read_logs_since(query.start_offset))
}

async fn health(State(state): State<ShardState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        role: state.role,
        shard_id: state.shard_id.clone(),
        offset: state.wal.current_offset(),
        keys: state.wal.key_count(),
    })
}

// --- background tasks -------------------------------------------------------

/// Re-announces this shard to the coordinator on a fixed interval, forever
/// (not just until the first success): a coordinator restart loses its
/// in-memory topology, and this is how a long-running shard rejoins without
/// needing an operator to restart it too (SPEC_FULL.md §4.6).
pub async fn run_registrar(
    http: reqwest::Client,
    coordinator_url: String,
    shard_id: String,
    my_address: String,
    role: Role,
    interval: Duration,
) {
    let body = ferrokv_core::RegisterRequest {
        shard_id: shard_id.clone(),
        url: my_address,
        role,
    };
    let url = format!("{coordinator_url}/shards/register");
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match http
            .post(&url)
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(shard_id = %shard_id, "registered with coordinator");
            }
            Ok(resp) => {
                warn!(shard_id = %shard_id, status = %resp.status(), "registration rejected");
            }
            Err(err) => {
                warn!(shard_id = %shard_id, %err, "registration attempt failed");
            }
        }
    }
}

/// Follower-only tick loop: `Idle -> Pulling -> Applying -> Idle`. Any
/// transport error is logged and the tick abandoned; the next tick retries
/// from the (unchanged) watermark. No back-off, no jitter, per SPEC_FULL.md
/// §4.5.
pub async fn run_replicator(
    http: reqwest::Client,
    leader_url: String,
    wal: Arc<WalManager>,
    interval: Duration,
    pull_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let start_offset = wal.current_offset();
        let url = format!("{leader_url}/replication/log?start_offset={start_offset}");
        let resp = match http.get(&url).timeout(pull_timeout).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(offset = start_offset, %err, "replication pull failed");
                continue;
            }
        };
        if !resp.status().is_success() {
            warn!(offset = start_offset, status = %resp.status(), "replication pull rejected");
            continue;
        }
        let entries = match resp.json::<Vec<ferrokv_core::WalEntry>>().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "replication response could not be parsed");
                continue;
            }
        };
        if entries.is_empty() {
            continue;
        }
        let pulled = entries.len();
        if let Err(err) = wal.apply_batch(entries).await {
            warn!(%err, "failed to apply replicated batch");
            continue;
        }
        info!(pulled, new_offset = wal.current_offset(), "applied replicated batch");
    }
}
