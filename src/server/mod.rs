//! HTTP server.
//!
//! - [`openai_api`]: OpenAI-compatible completion routes, health and metrics
//! - [`adapters_api`]: Adapter control plane and personas
//! - [`streaming`]: SSE streaming for token-by-token responses
//! - [`error`]: Error-to-response mapping

pub mod adapters_api;
pub mod error;
pub mod openai_api;
pub mod streaming;

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::Router;
use tokio::sync::Semaphore;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::inference::engine::InferenceEngine;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: InferenceEngine,
    pub config: Arc<Config>,
    /// Bounds how many completion requests may wait for the engine at once.
    pub queue: Semaphore,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: InferenceEngine) -> Self {
        let config = Arc::clone(engine.config());
        Self {
            queue: Semaphore::new(config.server.max_concurrent_requests),
            engine,
            config,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(openai_api::routes())
        .merge(adapters_api::routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
