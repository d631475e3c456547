//! Coordinator HTTP surface: a stateless router in front of the shard
//! nodes. Owns no record data — only the topology registry, the ring, and
//! the table registry (all in `ferrokv_cluster`).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ferrokv_cluster::{ClusterError, Registry};
use ferrokv_core::{
    storage_key, KeyError, QuorumQuery, QuorumReadResponse, RecordPayload, RecordQuery,
    RegisterRequest, StatusResponse, StorageReadResponse, StorageWriteRequest,
    StorageWriteResponse, TableRequest,
};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{info, warn};

const LEADER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const REPLICA_READ_TIMEOUT: Duration = Duration::from_secs(5);
const QUORUM_LEG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    cluster: Arc<Registry>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(cluster: Arc<Registry>) -> Self {
        Self {
            cluster,
            http: reqwest::Client::builder()
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("table {0} is unknown")]
    TableUnknown(String),

    #[error("no shards available")]
    NoShardsAvailable,

    #[error("shard {0} has no leader")]
    NoLeader(String),

    #[error("shard {0} has no replicas")]
    NoReplicas(String),

    #[error("not enough replicas (has {available}, need {requested})")]
    InsufficientReplicas { requested: usize, available: usize },

    #[error("key not found")]
    NotFound,

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("quorum unavailable")]
    QuorumUnavailable,
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NoShardsAvailable => ApiError::NoShardsAvailable,
        }
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::InsufficientReplicas { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::TableUnknown(_) | ApiError::NotFound | ApiError::QuorumUnavailable => {
                StatusCode::NOT_FOUND
            }
            ApiError::NoShardsAvailable | ApiError::NoLeader(_) | ApiError::NoReplicas(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn build_router(cluster: Arc<Registry>) -> Router {
    build_router_with_state(AppState::new(cluster))
}

fn build_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/shards/register", post(register_shard))
        .route("/tables", post(create_table))
        .route("/tables/:table/records", post(write_record))
        .route(
            "/tables/:table/records/:pk",
            get(read_record).delete(delete_record).head(head_record),
        )
        .route("/tables/:table/records/:pk/quorum", get(quorum_read))
        .with_state(state)
}

async fn register_shard(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Json<StatusResponse> {
    state.cluster.register(&req.shard_id, &req.url, req.role);
    info!(shard_id = %req.shard_id, url = %req.url, role = ?req.role, "shard registered");
    Json(StatusResponse::new("registered"))
}

async fn create_table(
    State(state): State<AppState>,
    Json(req): Json<TableRequest>,
) -> Json<StatusResponse> {
    let created = state.cluster.create_table(&req.name);
    if created {
        info!(table = %req.name, "table created");
    }
    Json(StatusResponse::new("created"))
}

async fn write_record(
    AxumPath(table): AxumPath<String>,
    State(state): State<AppState>,
    Json(payload): Json<RecordPayload>,
) -> Result<Json<StorageWriteResponse>, ApiError> {
    if !state.cluster.table_exists(&table) {
        return Err(ApiError::TableUnknown(table));
    }
    let key = storage_key(&payload.partition_key, payload.sort_key.as_deref())?;
    let resolution = state.cluster.resolve(&payload.partition_key)?;
    let leader = resolution
        .leader
        .ok_or_else(|| ApiError::NoLeader(resolution.shard_id.clone()))?;

    let response = forward_write(&state, &leader, &key, payload.value).await?;
    Ok(Json(response))
}

async fn delete_record(
    AxumPath((table, pk)): AxumPath<(String, String)>,
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let _ = &table; // deletes bypass the table registry, by design (§4.2)
    let key = storage_key(&pk, query.sort_key.as_deref())?;
    let resolution = state.cluster.resolve(&pk)?;
    let leader = resolution
        .leader
        .ok_or_else(|| ApiError::NoLeader(resolution.shard_id.clone()))?;

    let url = storage_url(&leader, &key);
    let resp = state
        .http
        .delete(&url)
        .timeout(LEADER_WRITE_TIMEOUT)
        .send()
        .await
        .map_err(|err| ApiError::UpstreamFailure(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ApiError::UpstreamFailure(format!(
            "leader returned {}",
            resp.status()
        )));
    }
    Ok(Json(StatusResponse::new("deleted")))
}

async fn read_record(
    AxumPath((_table, pk)): AxumPath<(String, String)>,
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<StorageReadResponse>, ApiError> {
    let key = storage_key(&pk, query.sort_key.as_deref())?;
    let resolution = state.cluster.resolve(&pk)?;
    if resolution.replicas.is_empty() {
        return Err(ApiError::NoReplicas(resolution.shard_id));
    }
    let body = single_replica_read(&state, &resolution.replicas, &key).await?;
    Ok(Json(body))
}

async fn head_record(
    AxumPath((_table, pk)): AxumPath<(String, String)>,
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> Result<StatusCode, ApiError> {
    let key = storage_key(&pk, query.sort_key.as_deref())?;
    let resolution = state.cluster.resolve(&pk)?;
    if resolution.replicas.is_empty() {
        return Err(ApiError::NoReplicas(resolution.shard_id));
    }
    single_replica_head(&state, &resolution.replicas, &key).await?;
    Ok(StatusCode::OK)
}

async fn quorum_read(
    AxumPath((_table, pk)): AxumPath<(String, String)>,
    State(state): State<AppState>,
    Query(query): Query<QuorumQuery>,
) -> Result<Json<QuorumReadResponse>, ApiError> {
    let key = storage_key(&pk, query.sort_key.as_deref())?;
    let resolution = state.cluster.resolve(&pk)?;
    if resolution.replicas.len() < query.r {
        return Err(ApiError::InsufficientReplicas {
            requested: query.r,
            available: resolution.replicas.len(),
        });
    }

    let sample = sample_distinct(&resolution.replicas, query.r);
    let legs = sample
        .iter()
        .map(|replica| read_for_quorum(&state, replica, &key));
    let results = futures::future::join_all(legs).await;

    let mut best: Option<StorageReadResponse> = None;
    for candidate in results.into_iter().flatten() {
        match &best {
            None => best = Some(candidate),
            Some(current) if candidate.version > current.version => best = Some(candidate),
            _ => {}
        }
    }

    match best {
        Some(body) => Ok(Json(QuorumReadResponse {
            value: body.value,
            version: body.version,
            quorum_met: true,
        })),
        None => Err(ApiError::QuorumUnavailable),
    }
}

// --- dispatch helpers ------------------------------------------------------

/// `#` inside a compound storage key would otherwise be parsed as the URL
/// fragment delimiter once the key is spliced into a request URL; axum's
/// `Path` extractor percent-decodes the segment back on the shard side.
fn storage_url(base: &str, key: &str) -> String {
    format!("{base}/storage/{}", key.replace('#', "%23"))
}

async fn forward_write(
    state: &AppState,
    leader: &str,
    key: &str,
    value: serde_json::Value,
) -> Result<StorageWriteResponse, ApiError> {
    let url = storage_url(leader, key);
    let resp = state
        .http
        .post(&url)
        .timeout(LEADER_WRITE_TIMEOUT)
        .json(&StorageWriteRequest { value })
        .send()
        .await
        .map_err(|err| ApiError::UpstreamFailure(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ApiError::UpstreamFailure(format!(
            "leader returned {}",
            resp.status()
        )));
    }
    resp.json::<StorageWriteResponse>()
        .await
        .map_err(|err| ApiError::UpstreamFailure(err.to_string()))
}

enum ReadProbe {
    Found(StorageReadResponse),
    NotFound,
    Failed,
}

async fn attempt_read(state: &AppState, replica: &str, key: &str) -> ReadProbe {
    let url = storage_url(replica, key);
    match state
        .http
        .get(&url)
        .timeout(REPLICA_READ_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) if resp.status() == StatusCode::NOT_FOUND => ReadProbe::NotFound,
        Ok(resp) if resp.status().is_success() => match resp.json::<StorageReadResponse>().await {
            Ok(body) => ReadProbe::Found(body),
            Err(_) => ReadProbe::Failed,
        },
        _ => ReadProbe::Failed,
    }
}

/// Sample a random replica, try it, and on transport failure resample and
/// retry exactly once. A well-formed 404 short-circuits without retrying.
async fn single_replica_read(
    state: &AppState,
    replicas: &[String],
    key: &str,
) -> Result<StorageReadResponse, ApiError> {
    let first = sample_one(replicas);
    match attempt_read(state, first, key).await {
        ReadProbe::Found(body) => return Ok(body),
        ReadProbe::NotFound => return Err(ApiError::NotFound),
        ReadProbe::Failed => {}
    }
    let second = sample_one(replicas);
    match attempt_read(state, second, key).await {
        ReadProbe::Found(body) => Ok(body),
        ReadProbe::NotFound => Err(ApiError::NotFound),
        ReadProbe::Failed => Err(ApiError::UpstreamFailure(
            "replica unreachable after retry".into(),
        )),
    }
}

enum HeadProbe {
    Present,
    Absent,
    Failed,
}

async fn attempt_head(state: &AppState, replica: &str, key: &str) -> HeadProbe {
    let url = storage_url(replica, key);
    match state
        .http
        .head(&url)
        .timeout(REPLICA_READ_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) if resp.status() == StatusCode::NOT_FOUND => HeadProbe::Absent,
        Ok(resp) if resp.status().is_success() => HeadProbe::Present,
        _ => HeadProbe::Failed,
    }
}

async fn single_replica_head(
    state: &AppState,
    replicas: &[String],
    key: &str,
) -> Result<(), ApiError> {
    let first = sample_one(replicas);
    match attempt_head(state, first, key).await {
        HeadProbe::Present => return Ok(()),
        HeadProbe::Absent => return Err(ApiError::NotFound),
        HeadProbe::Failed => {}
    }
    let second = sample_one(replicas);
    match attempt_head(state, second, key).await {
        HeadProbe::Present => Ok(()),
        HeadProbe::Absent => Err(ApiError::NotFound),
        HeadProbe::Failed => Err(ApiError::UpstreamFailure(
            "replica unreachable after retry".into(),
        )),
    }
}

async fn read_for_quorum(state: &AppState, replica: &str, key: &str) -> Option<StorageReadResponse> {
    let url = storage_url(replica, key);
    let resp = state
        .http
        .get(&url)
        .timeout(QUORUM_LEG_TIMEOUT)
        .send()
        .await
        .inspect_err(|err| warn!(replica, %err, "quorum leg failed"))
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<StorageReadResponse>().await.ok()
}

fn sample_one(replicas: &[String]) -> &str {
    replicas
        .choose(&mut rand::thread_rng())
        .expect("replicas is non-empty")
}

fn sample_distinct(replicas: &[String], r: usize) -> Vec<String> {
    replicas
        .choose_multiple(&mut rand::thread_rng(), r)
        .cloned()
        .collect()
}
