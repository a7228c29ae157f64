use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /health: last-run age, queue size, recent failures and active triggers.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !state.config.scheduler.modern.health.enabled {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "health endpoint is disabled"})),
        ));
    }

    let mut scheduler = state.scheduler.lock().await;
    match scheduler.health_status().await {
        Ok(report) => Ok(Json(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "health": report,
        }))),
        Err(e) => Err(internal(e)),
    }
}

/// GET /statistics: scheduler and queue counters.
pub async fn statistics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut scheduler = state.scheduler.lock().await;
    let stats = scheduler.statistics().map_err(internal)?;
    let queue = scheduler.queue().map(|q| q.statistics());
    Ok(Json(json!({
        "scheduler": stats,
        "queue": queue,
    })))
}

fn internal(e: cronkeep_scheduler::SchedulerError) -> (StatusCode, Json<Value>) {
    warn!(code = e.code(), "report failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string(), "code": e.code()})),
    )
}
