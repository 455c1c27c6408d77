//! The HTTP surface (spec.md §6) — a thin `axum::Router` calling straight
//! into [`crate::fleet::Fleet`] methods. Request validation, JSON shaping
//! and status-code mapping live here; none of the fleet lifecycle logic
//! does.

mod errors;
mod health;
mod instances;
mod sessions;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::fleet::Fleet;
use crate::store::session_repo::SessionRepository;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub session_repo: Arc<dyn SessionRepository>,
}

/// Build the full router: instance management, session introspection, and
/// the health check, wrapped in request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(instances::routes())
        .merge(sessions::routes())
        .merge(health::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
