//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API needed for LLM inference:
//! - POST /v1/chat/completions
//! - POST /v1/completions
//! - GET /v1/models
//! - GET /health
//! - GET /metrics (prometheus)
//!
//! Requests run with whatever adapters are active when they are admitted.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::inference::engine::{AdapterSnapshot, GenerationEvent, GenerationRequest};
use crate::inference::llama_ffi::TokenId;
use crate::prompt::{with_system_prompt, ChatMessage};
use crate::server::error::ApiError;
use crate::server::streaming::{generation_to_sse_stream, StreamKind};
use crate::server::{unix_now, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Sampling options shared by both completion endpoints. Unset fields take
/// the configured generation defaults.
#[derive(Debug, Default, Deserialize)]
pub struct SamplingOptions {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
    /// Stop strings; only strings that are a single token are honored.
    pub stop: Option<Vec<String>>,
}

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
}

/// Chat completion response (non-streaming).
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    /// Adapters active during generation.
    pub adapters: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// Completion request (non-chat).
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub sampling: SamplingOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
    pub adapters: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Model listing response.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub model: ModelSummary,
    pub adapters: AdapterSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub architecture: String,
    pub n_layers: usize,
    pub n_ctx_train: u32,
}

// ─── Helpers ───────────────────────────────────────────────────────────────

fn model_id(state: &AppState) -> String {
    let path = &state.engine.model().path;
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn generation_request(
    state: &AppState,
    request_id: &str,
    prompt_tokens: Vec<TokenId>,
    opts: &SamplingOptions,
) -> Result<GenerationRequest, ApiError> {
    let defaults = state.config.sampling_params();

    let temperature = opts.temperature.unwrap_or(defaults.temperature as f64);
    if !(temperature >= 0.0 && temperature.is_finite()) {
        return Err(ApiError::BadRequest(format!("invalid temperature {temperature}")));
    }
    let top_p = opts.top_p.unwrap_or(defaults.top_p as f64);
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(ApiError::BadRequest(format!("invalid top_p {top_p}")));
    }

    let model = state.engine.model();
    let mut stop_tokens = Vec::new();
    for stop in opts.stop.iter().flatten() {
        match model.tokenize(stop, false) {
            Ok(tokens) if tokens.len() == 1 => stop_tokens.push(tokens[0]),
            _ => debug!(stop, "Ignoring multi-token stop sequence"),
        }
    }

    Ok(GenerationRequest {
        request_id: request_id.to_string(),
        prompt_tokens,
        max_tokens: opts.max_tokens.unwrap_or(state.config.generation.max_tokens),
        temperature,
        top_p,
        seed: opts.seed.unwrap_or(defaults.seed),
        stop_tokens,
    })
}

/// Queue a generation; rejects when too many requests are already waiting.
async fn admit(
    state: &AppState,
    request: GenerationRequest,
) -> Result<mpsc::Receiver<GenerationEvent>, ApiError> {
    let _permit = state.queue.try_acquire().map_err(|_| ApiError::Busy)?;
    Ok(state.engine.generate(request).await)
}

struct Collected {
    text: String,
    prompt_tokens: usize,
    completion_tokens: usize,
    finish_reason: String,
    adapters: Vec<String>,
}

/// Drain a generation into a single response, bounded by the request timeout.
async fn collect(
    state: &AppState,
    mut rx: mpsc::Receiver<GenerationEvent>,
) -> Result<Collected, ApiError> {
    let drain = async move {
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token { text: t, .. } => text.push_str(&t),
                GenerationEvent::Done {
                    prompt_tokens,
                    completion_tokens,
                    finish_reason,
                    adapters,
                    ..
                } => {
                    return Ok(Collected {
                        text,
                        prompt_tokens,
                        completion_tokens,
                        finish_reason: finish_reason.to_string(),
                        adapters,
                    })
                }
                GenerationEvent::Error(e) => return Err(ApiError::Internal(e)),
            }
        }
        Err(ApiError::Internal("generation ended without completing".to_string()))
    };

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    tokio::time::timeout(timeout, drain)
        .await
        .map_err(|_| ApiError::Timeout)?
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }

    let request_id = Uuid::new_v4().to_string();
    let model = req.model.clone().unwrap_or_else(|| model_id(&state));

    info!(
        request_id = request_id,
        model = model,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat completion request"
    );

    let persona = state.engine.active_persona().await;
    let messages = with_system_prompt(
        &req.messages,
        persona.as_ref().and_then(|p| p.system_prompt.as_deref()),
    );
    let prompt = state.config.generation.chat_template.render(&messages);
    let prompt_tokens = state
        .engine
        .model()
        .tokenize(&prompt, true)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let gen_request = generation_request(&state, &request_id, prompt_tokens, &req.sampling)?;
    let rx = admit(&state, gen_request).await?;

    if req.stream {
        // Streaming response via SSE.
        let stream = generation_to_sse_stream(rx, request_id, model, StreamKind::Chat);
        return Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let out = collect(&state, rx).await?;
    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new("assistant", out.text),
            finish_reason: out.finish_reason,
        }],
        usage: Usage {
            prompt_tokens: out.prompt_tokens,
            completion_tokens: out.completion_tokens,
            total_tokens: out.prompt_tokens + out.completion_tokens,
        },
        adapters: out.adapters,
    };

    Ok(Json(response).into_response())
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let model = req.model.clone().unwrap_or_else(|| model_id(&state));

    info!(
        request_id = request_id,
        model = model,
        prompt_bytes = req.prompt.len(),
        stream = req.stream,
        "Completion request"
    );

    let prompt_tokens = state
        .engine
        .model()
        .tokenize(&req.prompt, true)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let gen_request = generation_request(&state, &request_id, prompt_tokens, &req.sampling)?;
    let rx = admit(&state, gen_request).await?;

    if req.stream {
        let stream = generation_to_sse_stream(rx, request_id, model, StreamKind::Completion);
        return Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let out = collect(&state, rx).await?;
    Ok(Json(CompletionResponse {
        id: format!("cmpl-{request_id}"),
        object: "text_completion".to_string(),
        created: unix_now(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text: out.text,
            finish_reason: out.finish_reason,
        }],
        usage: Usage {
            prompt_tokens: out.prompt_tokens,
            completion_tokens: out.completion_tokens,
            total_tokens: out.prompt_tokens + out.completion_tokens,
        },
        adapters: out.adapters,
    })
    .into_response())
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: model_id(&state),
            object: "model".to_string(),
            created: 0,
            owned_by: "local".to_string(),
        }],
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let model = state.engine.model();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: ModelSummary {
            id: model_id(&state),
            architecture: model.architecture.clone(),
            n_layers: model.n_layers,
            n_ctx_train: model.n_ctx_train,
        },
        adapters: state.engine.snapshot().await,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state
        .engine
        .metrics()
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}
