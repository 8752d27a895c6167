//! HTTP surface: routing and the health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use riptide_core::{Checkpoint, StateEngine};

use crate::admission::AdmissionCounter;
use crate::stream::stream_handler;

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StateEngine>,
    pub admission: AdmissionCounter,
    pub checkpoint: Arc<Checkpoint>,
}

/// Builds the router. Wrong methods on known paths answer 405 via axum's
/// method routing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `warm` flips once a replication resume position is known, either from
/// a restored snapshot or from live streaming.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "warm": state.checkpoint.get().is_some(),
        "time": Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::Lsn;

    #[tokio::test]
    async fn health_reports_warmth_from_the_checkpoint() {
        let checkpoint = Arc::new(Checkpoint::new());
        let state = AppState {
            engine: Arc::new(StateEngine::new()),
            admission: AdmissionCounter::connect(None, 10).await,
            checkpoint: checkpoint.clone(),
        };

        let cold = health_handler(State(state.clone())).await.into_response();
        assert_eq!(cold.status(), axum::http::StatusCode::OK);

        checkpoint.advance(Lsn::new(42));
        let warm = health_handler(State(state)).await.into_response();
        assert_eq!(warm.status(), axum::http::StatusCode::OK);
    }
}
