//! Inference engine: the single owner of the inference context.
//!
//! The context and the adapter registry live together in one [`Session`]
//! behind a FIFO async mutex. Every adapter operation holds the lock for its
//! whole duration, and a generation takes the lock when it is admitted and
//! keeps it until its last token. So:
//! 1. a generation runs with exactly the adapter set present at admission
//! 2. adapter changes submitted during a generation wait for it to finish
//! 3. generations submitted after an adapter change see the new set

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, AdapterInfo, AdapterRegistry, AdapterSpec, RegistryStats};
use crate::config::{Config, PersonaConfig};
use crate::inference::llama_ffi::{
    LlamaContext, LlamaError, LlamaModel, SamplingParams, TokenId, TOKEN_EOS,
};
use crate::metrics::Metrics;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Unknown persona: {0}")]
    UnknownPersona(String),
}

/// A generation request.
#[derive(Debug)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: String,

    /// Input token IDs (prompt).
    pub prompt_tokens: Vec<TokenId>,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f64,

    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,

    /// Sampler seed.
    pub seed: u64,

    /// Stop sequences (as token IDs).
    pub stop_tokens: Vec<TokenId>,
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence or a stop token.
    Stop,
    /// `max_tokens` or the context window was reached.
    Length,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
        }
    }
}

/// A generated token event.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A new token was generated.
    Token {
        token_id: TokenId,
        text: String,
    },
    /// Generation is complete.
    Done {
        total_tokens: usize,
        prompt_tokens: usize,
        completion_tokens: usize,
        finish_reason: FinishReason,
        /// Adapters the generation ran with.
        adapters: Vec<String>,
    },
    /// An error occurred during generation.
    Error(String),
}

/// Active adapters, registry counters and the active persona.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterSnapshot {
    pub active: Vec<AdapterInfo>,
    pub stats: RegistryStats,
    pub persona: Option<String>,
}

struct Session {
    context: LlamaContext,
    adapters: AdapterRegistry,
    persona: Option<String>,
}

impl Session {
    /// The persona counts as active only while its adapter is.
    fn active_persona(&self) -> Option<&str> {
        self.persona
            .as_deref()
            .filter(|name| self.adapters.get(name).is_some())
    }
}

/// The inference engine.
pub struct InferenceEngine {
    session: Arc<Mutex<Session>>,

    model: Arc<LlamaModel>,

    /// Configuration.
    config: Arc<Config>,

    metrics: Metrics,

    /// Next sequence ID.
    next_seq_id: AtomicU64,
}

impl InferenceEngine {
    /// Create the engine and its single inference context.
    pub fn new(
        model: Arc<LlamaModel>,
        config: Arc<Config>,
        metrics: Metrics,
    ) -> Result<Self, LlamaError> {
        let context = model.new_context(config.context_params())?;
        let adapters = AdapterRegistry::new(Arc::clone(&model));

        info!(
            n_ctx = context.n_ctx,
            n_threads = context.n_threads,
            graph_node_budget = context.graph_node_budget(),
            base_graph_nodes = model.base_graph_nodes(),
            "Inference context ready"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(Session {
                context,
                adapters,
                persona: None,
            })),
            model,
            config,
            metrics,
            next_seq_id: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &Arc<LlamaModel> {
        &self.model
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run one registry operation under the session lock and record it.
    async fn with_registry<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Session) -> Result<T, AdapterError>,
    ) -> Result<T, AdapterError> {
        let mut session = self.session.lock().await;
        let before = session.adapters.stats();
        let result = f(&mut *session);
        self.observe(op, &result, before, &*session);
        result
    }

    fn observe<T>(
        &self,
        op: &str,
        result: &Result<T, AdapterError>,
        before: RegistryStats,
        session: &Session,
    ) {
        let after = session.adapters.stats();
        self.metrics.record_op(op, result);
        self.metrics.adapter_parses.inc_by(after.parsed - before.parsed);
        self.metrics
            .adapter_cache_hits
            .inc_by(after.cache_hits - before.cache_hits);
        self.metrics.active_adapters.set(after.active as i64);

        if let Err(e) = result {
            warn!(op, error = %e, "Adapter operation failed");
        }
    }

    /// Load and activate an adapter.
    pub async fn load_adapter(&self, spec: AdapterSpec) -> Result<AdapterInfo, AdapterError> {
        self.with_registry("load", |s| s.adapters.load(&mut s.context, &spec))
            .await
    }

    /// Load every adapter in order, stopping at the first failure.
    pub async fn preload(&self, specs: &[AdapterSpec]) -> Result<Vec<AdapterInfo>, AdapterError> {
        let mut loaded = Vec::with_capacity(specs.len());
        for spec in specs {
            loaded.push(self.load_adapter(spec.clone()).await?);
        }
        Ok(loaded)
    }

    pub async fn remove_adapter(&self, name: &str) -> Result<AdapterInfo, AdapterError> {
        self.with_registry("remove", |s| s.adapters.remove(&mut s.context, name))
            .await
    }

    pub async fn update_adapter_scale(
        &self,
        name: &str,
        scale: f32,
    ) -> Result<AdapterInfo, AdapterError> {
        self.with_registry("update_scale", |s| {
            s.adapters.update_scale(&mut s.context, name, scale)
        })
        .await
    }

    /// Detach all adapters. Returns how many were detached.
    pub async fn clear_adapters(&self) -> usize {
        self.with_registry("clear", |s| Ok(s.adapters.clear_all(&mut s.context)))
            .await
            .unwrap_or_default()
    }

    pub async fn swap_adapter(
        &self,
        old: &str,
        target: &str,
        scale: Option<f32>,
        name: Option<String>,
    ) -> Result<AdapterInfo, AdapterError> {
        self.with_registry("swap", |s| {
            s.adapters.swap(&mut s.context, old, target, scale, name)
        })
        .await
    }

    pub async fn prune_adapter_cache(&self) -> usize {
        self.with_registry("prune", |s| Ok(s.adapters.prune_cache()))
            .await
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> AdapterSnapshot {
        let session = self.session.lock().await;
        AdapterSnapshot {
            active: session.adapters.active(),
            stats: session.adapters.stats(),
            persona: session.active_persona().map(str::to_string),
        }
    }

    /// Replace all adapters with the persona's adapter.
    ///
    /// If the persona adapter cannot be activated the previous adapters are
    /// restored from the cache.
    pub async fn activate_persona(&self, name: &str) -> Result<AdapterInfo, EngineError> {
        let persona = self
            .config
            .persona(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPersona(name.to_string()))?;
        let spec = persona.adapter_spec();

        let result = self
            .with_registry("persona", |s| {
                let previous: Vec<AdapterSpec> = s
                    .adapters
                    .active()
                    .into_iter()
                    .map(|a| AdapterSpec::new(a.path, a.scale).named(a.name))
                    .collect();

                s.adapters.clear_all(&mut s.context);
                match s.adapters.load(&mut s.context, &spec) {
                    Ok(info) => {
                        s.persona = Some(persona.name.clone());
                        Ok(info)
                    }
                    Err(e) => {
                        for prev in &previous {
                            if let Err(restore) = s.adapters.load(&mut s.context, prev) {
                                warn!(adapter = prev.resolved_name(), error = %restore, "Failed to restore adapter");
                            }
                        }
                        Err(e)
                    }
                }
            })
            .await?;

        info!(persona = name, "Activated persona");
        Ok(result)
    }

    /// The active persona, if its adapter is still applied.
    pub async fn active_persona(&self) -> Option<PersonaConfig> {
        let session = self.session.lock().await;
        session
            .active_persona()
            .and_then(|name| self.config.persona(name))
            .cloned()
    }

    /// Run a generation request, streaming tokens to the returned receiver.
    ///
    /// The session lock is acquired before this returns, so the generation
    /// is ordered with respect to adapter operations by submission time. The
    /// lock is released when generation ends or the receiver is dropped.
    pub async fn generate(&self, request: GenerationRequest) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(32);

        let seq_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
        let mut session = Arc::clone(&self.session).lock_owned().await;
        let model = Arc::clone(&self.model);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let Session {
                context, adapters, ..
            } = &mut *session;
            let adapter_names = adapters.names();
            let prompt_len = request.prompt_tokens.len();

            info!(
                request_id = request.request_id,
                seq_id,
                prompt_tokens = prompt_len,
                max_tokens = request.max_tokens,
                adapters = ?adapter_names,
                "Starting generation"
            );
            metrics.generations.inc();

            context.kv_cache_clear();
            if let Err(e) = decode_prompt(context, &request.prompt_tokens) {
                warn!(request_id = request.request_id, error = %e, "Prompt decode failed");
                let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                return;
            }

            let sampling = SamplingParams {
                temperature: request.temperature as f32,
                top_p: request.top_p as f32,
                seed: request.seed,
            };

            let mut generated = 0;
            let mut finish_reason = FinishReason::Length;
            while generated < request.max_tokens {
                let token_id = context.sample(&sampling);
                if token_id == TOKEN_EOS {
                    finish_reason = FinishReason::Stop;
                    break;
                }

                generated += 1;
                let text = model.token_to_piece(token_id);

                if tx
                    .send(GenerationEvent::Token { token_id, text })
                    .await
                    .is_err()
                {
                    // Receiver dropped, stop generating.
                    debug!(request_id = request.request_id, generated, "Generation cancelled");
                    metrics.generated_tokens.inc_by(generated as u64);
                    return;
                }

                // Check for stop tokens.
                if request.stop_tokens.contains(&token_id) {
                    finish_reason = FinishReason::Stop;
                    break;
                }

                if context.kv_cache_used() >= context.n_ctx as usize {
                    break;
                }
                if let Err(e) = context.decode(&[token_id]) {
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    metrics.generated_tokens.inc_by(generated as u64);
                    return;
                }
            }

            metrics.generated_tokens.inc_by(generated as u64);

            let _ = tx
                .send(GenerationEvent::Done {
                    total_tokens: prompt_len + generated,
                    prompt_tokens: prompt_len,
                    completion_tokens: generated,
                    finish_reason,
                    adapters: adapter_names,
                })
                .await;

            info!(
                request_id = request.request_id,
                generated,
                finish_reason = %finish_reason,
                "Generation complete"
            );
        });

        rx
    }
}

/// Decode the prompt in `n_batch`-sized chunks.
fn decode_prompt(context: &mut LlamaContext, prompt: &[TokenId]) -> Result<(), LlamaError> {
    if prompt.is_empty() {
        return Err(LlamaError::DecodeFailed("empty prompt".to_string()));
    }
    let n_batch = context.n_batch.max(1) as usize;
    for chunk in prompt.chunks(n_batch) {
        context.decode(chunk)?;
    }
    Ok(())
}
