use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::ids::{BranchId, DocumentId, RoomKey, SnapshotId, UserId};
use crate::persistence::{BranchRecord, SnapshotRecord};
use crate::room::{RoomHandle, RoomStatus};
use crate::session::{encode_blob, peer};

/// Request payload for issuing a join ticket.
#[derive(Debug, Deserialize, Serialize)]
pub struct IssueTicketRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IssueTicketResponse {
    pub ticket: String,
    pub expires_at: i64,
}

/// Query parameters expected by the websocket entrypoint.
#[derive(Debug, Deserialize)]
pub struct TicketQuery {
    pub ticket: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_by: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SnapshotResponse {
    pub id: SnapshotId,
    pub document_id: DocumentId,
    pub name: String,
    pub description: Option<String>,
    pub section_count: u32,
    pub total_bars: u64,
    pub created_by: UserId,
    pub created_at: i64,
    /// Base64 document state; only on single-snapshot reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateBranchRequest {
    pub name: String,
    #[serde(default)]
    pub source_snapshot_id: Option<SnapshotId>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BranchResponse {
    pub id: BranchId,
    pub document_id: DocumentId,
    pub name: String,
    pub source_snapshot_id: Option<SnapshotId>,
    pub is_main: bool,
    pub merged_at: Option<i64>,
    pub created_at: i64,
    pub room: RoomKey,
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    #[serde(flatten)]
    pub status: RoomStatus,
    pub degraded: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub rooms: usize,
    pub degraded_rooms: Vec<RoomKey>,
}

/// Build the HTTP router with all public endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/documents/{doc_id}/ticket", post(issue_ticket))
        .route("/api/documents/{doc_id}", get(get_document))
        .route(
            "/api/documents/{doc_id}/snapshots",
            get(list_snapshots).post(create_snapshot),
        )
        .route(
            "/api/documents/{doc_id}/snapshots/{snapshot_id}",
            get(get_snapshot).delete(delete_snapshot),
        )
        .route(
            "/api/documents/{doc_id}/snapshots/{snapshot_id}/restore",
            post(restore_snapshot),
        )
        .route(
            "/api/documents/{doc_id}/branches",
            get(list_branches).post(create_branch),
        )
        .route(
            "/api/documents/{doc_id}/branches/{branch_id}",
            axum::routing::delete(delete_branch),
        )
        .route(
            "/api/documents/{doc_id}/branches/{branch_id}/merge",
            post(merge_branch),
        )
        .route("/edit", get(ws_handler))
        .layer(
            TraceLayer::new_for_http()
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<TicketQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let ticket = params
        .ticket
        .ok_or_else(|| AppError::InvalidTicket("ticket query parameter required".to_string()))?;

    // Refused before the upgrade: nothing about any room is shared.
    let subject = state.ticketing.validate(&ticket)?;
    Ok(ws.on_upgrade(move |socket| peer(socket, state, subject)))
}

async fn issue_ticket(
    Path(doc_id): Path<DocumentId>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IssueTicketRequest>,
) -> Result<Json<IssueTicketResponse>, AppError> {
    let issued = state.ticketing.issue(doc_id, &UserId(payload.user_id))?;

    Ok(Json(IssueTicketResponse {
        ticket: issued.token,
        expires_at: issued.expires_at,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        rooms: state.registry.len().await,
        degraded_rooms: state.registry.degraded_rooms().await,
    })
}

async fn get_document(
    Path(doc_id): Path<DocumentId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentResponse>, AppError> {
    let response = state
        .registry
        .with_room(RoomKey::main(doc_id), |handle: RoomHandle| async move {
            let status = handle.status().await?;
            Ok::<_, AppError>(DocumentResponse {
                status,
                degraded: handle.health().is_degraded(),
            })
        })
        .await?;
    Ok(Json(response))
}

// ---------- Snapshot APIs ----------

fn to_snapshot_response(record: SnapshotRecord, with_state: bool) -> SnapshotResponse {
    SnapshotResponse {
        state: with_state.then(|| encode_blob(&record.state)),
        id: record.id,
        document_id: record.document_id,
        name: record.name,
        description: record.description,
        section_count: record.section_count,
        total_bars: record.total_bars,
        created_by: record.created_by,
        created_at: record.created_at,
    }
}

async fn list_snapshots(
    Path(doc_id): Path<DocumentId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SnapshotResponse>>, AppError> {
    let snapshots = state.snapshots.list(doc_id).await?;
    Ok(Json(
        snapshots
            .into_iter()
            .map(|record| to_snapshot_response(record, false))
            .collect(),
    ))
}

async fn create_snapshot(
    Path(doc_id): Path<DocumentId>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSnapshotRequest>,
) -> Result<(StatusCode, Json<SnapshotResponse>), AppError> {
    let record = state
        .snapshots
        .create(
            doc_id,
            &payload.name,
            payload.description,
            &UserId(payload.created_by),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(to_snapshot_response(record, false))))
}

async fn get_snapshot(
    Path((doc_id, snapshot_id)): Path<(DocumentId, SnapshotId)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SnapshotResponse>, AppError> {
    let record = state.snapshots.get(doc_id, snapshot_id).await?;
    Ok(Json(to_snapshot_response(record, true)))
}

async fn delete_snapshot(
    Path((doc_id, snapshot_id)): Path<(DocumentId, SnapshotId)>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, AppError> {
    state.snapshots.delete(doc_id, snapshot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_snapshot(
    Path((doc_id, snapshot_id)): Path<(DocumentId, SnapshotId)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SnapshotResponse>, AppError> {
    let record = state.snapshots.restore(doc_id, snapshot_id).await?;
    Ok(Json(to_snapshot_response(record, false)))
}

// ---------- Branch APIs ----------

fn to_branch_response(record: BranchRecord) -> BranchResponse {
    BranchResponse {
        room: record.room(),
        id: record.id,
        document_id: record.document_id,
        name: record.name,
        source_snapshot_id: record.source_snapshot_id,
        is_main: record.is_main,
        merged_at: record.merged_at,
        created_at: record.created_at,
    }
}

async fn list_branches(
    Path(doc_id): Path<DocumentId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BranchResponse>>, AppError> {
    let branches = state.branches.list(doc_id).await?;
    Ok(Json(branches.into_iter().map(to_branch_response).collect()))
}

async fn create_branch(
    Path(doc_id): Path<DocumentId>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateBranchRequest>,
) -> Result<(StatusCode, Json<BranchResponse>), AppError> {
    let record = state
        .branches
        .create(doc_id, &payload.name, payload.source_snapshot_id)
        .await?;
    Ok((StatusCode::CREATED, Json(to_branch_response(record))))
}

async fn delete_branch(
    Path((doc_id, branch_id)): Path<(DocumentId, BranchId)>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, AppError> {
    state.branches.delete(doc_id, branch_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn merge_branch(
    Path((doc_id, branch_id)): Path<(DocumentId, BranchId)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<BranchResponse>, AppError> {
    let record = state.branches.merge(doc_id, branch_id).await?;
    Ok(Json(to_branch_response(record)))
}
