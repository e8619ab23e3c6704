//! Abuse & Blocking routes (C9) — per-user block lists and reports for admin review.

use axum::{
    extract::{Extension, Path, State},
    routing::{get, post},
    Json, Router,
};
use meridian_common::{
    error::{RelayError, RelayResult},
    models::abuse::{AbuseReport, BlockRequest, ReportRequest, ReportStatus, ResolveReportRequest},
    validation::validate_request,
};
use meridian_storage::repository::{abuse, roles};
use std::sync::Arc;
use uuid::Uuid;

use crate::{middleware::AuthContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/abuse/block", post(block_user))
        .route("/abuse/block/{user_id}", axum::routing::delete(unblock_user))
        .route("/abuse/blocked", get(list_blocked))
        .route("/abuse/reports", get(list_reports).post(create_report))
        .route("/abuse/reports/{report_id}", get(get_report).post(resolve_report))
}

async fn block_user(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<BlockRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let blocker = auth.require_user()?;
    state.storage.db.write("block_user", move |conn| abuse::block(conn, blocker, body.user_id)).await?;
    Ok(Json(serde_json::json!({ "blocked": true })))
}

async fn unblock_user(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(blocked): Path<Uuid>,
) -> RelayResult<Json<serde_json::Value>> {
    let blocker = auth.require_user()?;
    state.storage.db.write("unblock_user", move |conn| abuse::unblock(conn, blocker, blocked)).await?;
    Ok(Json(serde_json::json!({ "unblocked": true })))
}

async fn list_blocked(Extension(auth): Extension<AuthContext>, State(state): State<Arc<AppState>>) -> RelayResult<Json<Vec<Uuid>>> {
    let blocker = auth.require_user()?;
    let conn = state.storage.db.read()?;
    Ok(Json(abuse::list_blocked(&conn, blocker)?))
}

/// POST /api/v1/abuse/reports — file a report; always created `status=pending`.
async fn create_report(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReportRequest>,
) -> RelayResult<Json<AbuseReport>> {
    let reporter = auth.require_user()?;
    validate_request(&body)?;

    let report = state
        .storage
        .db
        .write("create_report", move |conn| abuse::create_report(conn, reporter, body.reported, &body.description, &body.photos))
        .await?;

    Ok(Json(report))
}

/// GET /api/v1/abuse/reports?status=pending — moderator/admin review queue.
async fn list_reports(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    axum::extract::Query(params): axum::extract::Query<std::collections::HashMap<String, String>>,
) -> RelayResult<Json<Vec<AbuseReport>>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    require_review_permission(&conn, user_id)?;

    let status = match params.get("status").map(String::as_str) {
        Some("under_review") => ReportStatus::UnderReview,
        Some("resolved") => ReportStatus::Resolved,
        Some("dismissed") => ReportStatus::Dismissed,
        _ => ReportStatus::Pending,
    };
    Ok(Json(abuse::list_reports_by_status(&conn, status)?))
}

async fn get_report(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<Uuid>,
) -> RelayResult<Json<AbuseReport>> {
    let user_id = auth.require_user()?;
    let conn = state.storage.db.read()?;
    require_review_permission(&conn, user_id)?;
    abuse::find_report(&conn, report_id)?.map(Json).ok_or_else(|| RelayError::not_found("abuse report"))
}

/// POST /api/v1/abuse/reports/:report_id — transition a report to a terminal/interim status.
async fn resolve_report(
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<Uuid>,
    Json(body): Json<ResolveReportRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let user_id = auth.require_user()?;
    {
        let conn = state.storage.db.read()?;
        require_review_permission(&conn, user_id)?;
    }
    state.storage.db.write("resolve_report", move |conn| abuse::resolve_report(conn, report_id, body.status)).await?;
    Ok(Json(serde_json::json!({ "status": body.status })))
}

fn require_review_permission(conn: &rusqlite::Connection, user_id: Uuid) -> RelayResult<()> {
    let perms = roles::server_permissions_for_user(conn, user_id)?;
    let set = meridian_common::permissions::PermissionSet::from_iter(perms);
    if !set.has("abuse.review") {
        return Err(RelayError::permission_denied("abuse.review"));
    }
    Ok(())
}
