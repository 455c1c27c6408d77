//! `/instances/*` endpoints (spec.md §6): create, list, read, QR lookup,
//! restart, delete.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::error::{Error, Result};
use crate::store::registry::Instance;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/instances/create", post(create_instance))
        .route("/instances", get(list_instances))
        .route("/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/instances/{id}/qr", get(get_qr))
        .route("/instances/{id}/restart", post(restart_instance))
}

/// Wire shape of `whatsapp_instances` (spec.md §6), the JSON the HTTP
/// surface actually returns — status as a lowercase string, not the Rust enum.
#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub instance_name: String,
    pub webhook_url: String,
    pub is_connected: bool,
    pub connection_status: String,
    pub qr_code: Option<String>,
    pub qr_code_expires_at: Option<DateTime<Utc>>,
    pub owner_phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl From<Instance> for InstanceResponse {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.id,
            user_id: instance.user_id,
            instance_name: instance.instance_name,
            webhook_url: instance.webhook_url,
            is_connected: instance.is_connected,
            connection_status: instance.connection_status.as_str().to_string(),
            qr_code: instance.qr_code,
            qr_code_expires_at: instance.qr_code_expires_at,
            owner_phone_number: instance.owner_phone_number,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            last_connected_at: instance.last_connected_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub user_id: Uuid,
    pub instance_name: String,
    pub webhook_url: String,
}

/// `instance_name` must be non-empty; `webhook_url` must parse as an
/// absolute http(s) URL. Both are request-shape checks (spec.md §7's
/// `ValidationError`), kept at the HTTP boundary rather than in the Fleet
/// Coordinator.
fn validate_create(req: &CreateInstanceRequest) -> Result<()> {
    if req.instance_name.trim().is_empty() {
        return Err(Error::Validation("instance_name must not be empty".into()));
    }
    let url = url::Url::parse(&req.webhook_url)
        .map_err(|e| Error::Validation(format!("webhook_url is not a valid URL: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::Validation(
            "webhook_url must use http or https".into(),
        ));
    }
    Ok(())
}

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceResponse>)> {
    validate_create(&req)?;
    let instance = state
        .fleet
        .create_instance(req.user_id, req.instance_name, req.webhook_url)
        .await?;
    Ok((StatusCode::CREATED, Json(instance.into())))
}

async fn list_instances(State(state): State<AppState>) -> Result<Json<Vec<InstanceResponse>>> {
    let instances = state.fleet.list_instances().await?;
    Ok(Json(instances.into_iter().map(Into::into).collect()))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>> {
    let instance = state.fleet.get_instance(id).await?;
    Ok(Json(instance.into()))
}

#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub qr_code: Option<String>,
    pub connection_status: String,
}

async fn get_qr(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<QrResponse>> {
    let (qr_code, status) = state.fleet.get_qr(id).await?;
    Ok(Json(QrResponse {
        qr_code,
        connection_status: status.as_str().to_string(),
    }))
}

async fn restart_instance(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.fleet.restart_instance(id).await?;
    Ok(StatusCode::OK)
}

async fn delete_instance(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.fleet.delete_instance(id).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let req = CreateInstanceRequest {
            user_id: Uuid::new_v4(),
            instance_name: "  ".into(),
            webhook_url: "https://example.com/hook".into(),
        };
        assert!(matches!(validate_create(&req), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let req = CreateInstanceRequest {
            user_id: Uuid::new_v4(),
            instance_name: "vendas-01".into(),
            webhook_url: "ftp://example.com/hook".into(),
        };
        assert!(matches!(validate_create(&req), Err(Error::Validation(_))));
    }

    #[test]
    fn accepts_well_formed_request() {
        let req = CreateInstanceRequest {
            user_id: Uuid::new_v4(),
            instance_name: "vendas-01".into(),
            webhook_url: "https://n8n.example.com/hook".into(),
        };
        assert!(validate_create(&req).is_ok());
    }
}
