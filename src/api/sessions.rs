//! `/auth/sessions/*` endpoints (spec.md §6): read-only introspection of the
//! Session State Store, plus the delete escape hatch used to force a wipe
//! without going through `delete_instance`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::error::Result;
use crate::store::session;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/sessions", get(list_sessions))
        .route(
            "/auth/sessions/{name}",
            get(session_exists).delete(delete_session),
        )
}

#[derive(Debug, Serialize)]
pub struct SessionSummaryResponse {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummaryResponse>>> {
    let sessions = state.session_repo.list().await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionSummaryResponse {
                id: s.instance_name,
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct SessionExistsResponse {
    pub exists: bool,
}

async fn session_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SessionExistsResponse>> {
    let exists = state.session_repo.exists(&name).await?;
    Ok(Json(SessionExistsResponse { exists }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    session::remove_session(&*state.session_repo, &name).await?;
    Ok(StatusCode::OK)
}
