use axum::{
    routing::{get, post},
    Router,
};
use cronkeep_core::config::CronkeepConfig;
use cronkeep_scheduler::Scheduler;
use std::sync::Arc;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CronkeepConfig,
    /// tokio::sync::Mutex because runs are awaited while the lock is held.
    pub scheduler: tokio::sync::Mutex<Scheduler>,
}

impl AppState {
    pub fn new(config: CronkeepConfig, scheduler: Scheduler) -> Self {
        Self {
            config,
            scheduler: tokio::sync::Mutex::new(scheduler),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/statistics", get(crate::http::health::statistics_handler))
        .route("/webhook", post(crate::http::webhook::webhook_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
