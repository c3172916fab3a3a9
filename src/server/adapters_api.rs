//! Adapter control plane.
//!
//! - GET/POST/DELETE /v1/adapters
//! - PATCH/DELETE /v1/adapters/{name}
//! - POST /v1/adapters/{name}/swap
//! - POST /v1/adapter-cache/prune
//! - GET /v1/personas, POST /v1/personas/{name}/activate

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapters::{AdapterInfo, AdapterSpec};
use crate::inference::engine::AdapterSnapshot;
use crate::server::error::ApiError;
use crate::server::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/v1/adapters",
            get(list_adapters).post(load_adapter).delete(clear_adapters),
        )
        .route(
            "/v1/adapters/{name}",
            axum::routing::delete(remove_adapter).patch(update_scale),
        )
        .route("/v1/adapters/{name}/swap", post(swap_adapter))
        .route("/v1/adapter-cache/prune", post(prune_cache))
        .route("/v1/personas", get(list_personas))
        .route("/v1/personas/{name}/activate", post(activate_persona))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub scale: f32,
}

/// Replace the adapter named in the path with `target`, a known adapter
/// name or a file path.
#[derive(Debug, Serialize, Deserialize)]
pub struct SwapRequest {
    pub target: String,
    #[serde(default)]
    pub scale: Option<f32>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PruneResponse {
    pub pruned: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersonaInfo {
    pub name: String,
    pub adapter: PathBuf,
    pub scale: f32,
    pub system_prompt: Option<String>,
    pub active: bool,
}

async fn list_adapters(State(state): State<Arc<AppState>>) -> Json<AdapterSnapshot> {
    Json(state.engine.snapshot().await)
}

async fn load_adapter(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<AdapterSpec>,
) -> Result<(StatusCode, Json<AdapterInfo>), ApiError> {
    let info = state.engine.load_adapter(spec).await?;
    info!(adapter = info.name, scale = info.scale, "Adapter loaded via API");
    Ok((StatusCode::CREATED, Json(info)))
}

async fn clear_adapters(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let cleared = state.engine.clear_adapters().await;
    Json(ClearResponse { cleared })
}

async fn remove_adapter(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AdapterInfo>, ApiError> {
    Ok(Json(state.engine.remove_adapter(&name).await?))
}

async fn update_scale(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> Result<Json<AdapterInfo>, ApiError> {
    Ok(Json(
        state.engine.update_adapter_scale(&name, req.scale).await?,
    ))
}

async fn swap_adapter(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SwapRequest>,
) -> Result<Json<AdapterInfo>, ApiError> {
    let info = state
        .engine
        .swap_adapter(&name, &req.target, req.scale, req.name)
        .await?;
    info!(old = name, new = info.name, "Adapter swapped via API");
    Ok(Json(info))
}

async fn prune_cache(State(state): State<Arc<AppState>>) -> Json<PruneResponse> {
    let pruned = state.engine.prune_adapter_cache().await;
    Json(PruneResponse { pruned })
}

async fn list_personas(State(state): State<Arc<AppState>>) -> Json<Vec<PersonaInfo>> {
    let active = state.engine.snapshot().await.persona;
    let personas = state
        .config
        .personas
        .iter()
        .map(|p| PersonaInfo {
            name: p.name.clone(),
            adapter: p.adapter.clone(),
            scale: p.scale,
            system_prompt: p.system_prompt.clone(),
            active: active.as_deref() == Some(p.name.as_str()),
        })
        .collect();
    Json(personas)
}

async fn activate_persona(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AdapterInfo>, ApiError> {
    Ok(Json(state.engine.activate_persona(&name).await?))
}
