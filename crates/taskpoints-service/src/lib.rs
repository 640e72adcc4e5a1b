//! HTTP JSON API over the Taskpoints engine.

pub mod api;
pub mod error;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use taskpoints_core::digest::DigestOptions;
use taskpoints_core::error::EngineError;
use taskpoints_core::lifecycle::Engine;
use taskpoints_core::notify::Notifier;

use crate::error::ApiError;

/// Shared by every handler. The store is the only mutable state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub notifier: Arc<dyn Notifier>,
    pub digest: Arc<DigestOptions>,
}

impl AppState {
    pub fn new(engine: Engine, notifier: Arc<dyn Notifier>, digest: DigestOptions) -> Self {
        Self {
            engine,
            notifier,
            digest: Arc::new(digest),
        }
    }

    /// Runs a store-bound engine call on the blocking pool.
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?
            .map_err(ApiError::from)
    }
}

pub fn router(state: AppState, public_dir: Option<&Path>) -> Router {
    let api = Router::new()
        .route("/health", get(api::health))
        .route("/login", post(api::login))
        .route("/users", get(api::users))
        .route("/leaderboard", get(api::leaderboard))
        .route("/goals", get(api::goals))
        .route("/selectedGoals", get(api::selected_goals))
        .route("/addGoal", post(api::add_goal))
        .route("/startGoal", post(api::start_goal))
        .route("/finishGoal", post(api::finish_goal))
        .route("/pendingGoals", get(api::pending_goals))
        .route("/approveGoal", post(api::approve_goal))
        .route("/assignTask", post(api::assign_task))
        .route("/tasks/:username", get(api::tasks))
        .route("/startTask", post(api::start_task))
        .route("/finishTask", post(api::finish_task))
        .route("/pendingTasks", get(api::pending_tasks))
        .route("/approveTask", post(api::approve_task))
        .route("/completed/:username", get(api::completed))
        .route("/weeklyStats/:username", get(api::weekly_stats))
        .route("/runDigest", post(api::run_digest_now))
        .with_state(state);

    let app = match public_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    };
    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
