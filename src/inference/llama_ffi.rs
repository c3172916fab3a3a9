//! Bindings to the llama.cpp model, context and LoRA adapter API.
//!
//! The types here mirror `llama_model`, `llama_context` and
//! `llama_adapter_lora`. This build uses an in-process stand-in for the C
//! library: model and adapter files are validated by reading their GGUF
//! headers, adapter attachment enforces the engine's static graph node
//! budget, and decode/sample are deterministic emulations. Callers never see
//! the difference between the stand-in and a linked library.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::inference::gguf::{GgufHeader, GgufValue};

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Failed to load adapter: {0}")]
    AdapterLoadFailed(String),

    #[error("Failed to apply adapter: {0}")]
    AdapterApplyFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),
}

/// Token ID type.
pub type TokenId = i32;

pub const TOKEN_BOS: TokenId = 1;
pub const TOKEN_EOS: TokenId = 2;

/// Byte tokens start after the special tokens.
const BYTE_TOKEN_OFFSET: TokenId = 3;
const MIN_VOCAB: usize = 256 + BYTE_TOKEN_OFFSET as usize;
const DEFAULT_VOCAB: usize = 32000;
const DEFAULT_CONTEXT_LENGTH: u32 = 2048;

/// Graph size model: fixed overhead plus a per-layer cost, and four extra
/// nodes (two matmuls, scale, add) for every LoRA A/B pair attached.
const GRAPH_BASE_NODES: usize = 16;
const GRAPH_NODES_PER_LAYER: usize = 32;
const GRAPH_NODES_PER_LORA_PAIR: usize = 4;

/// Default static graph capacity (LLAMA_MAX_NODES).
pub const DEFAULT_GRAPH_NODE_BUDGET: usize = 8192;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of GPU layers to offload.
    pub n_gpu_layers: i32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: -1, // all layers
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens (0 = use the model's training context).
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,

    /// Maximum computation graph size in nodes.
    pub graph_node_budget: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 0,
            n_batch: 512,
            n_threads: 4,
            graph_node_budget: DEFAULT_GRAPH_NODE_BUDGET,
        }
    }
}

/// Sampler chain settings (temperature → top-p → dist).
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
        }
    }
}

/// A loaded base model (wraps `*mut llama_model`).
#[derive(Debug)]
pub struct LlamaModel {
    id: u64,

    /// Model file path.
    pub path: PathBuf,

    /// `general.architecture`.
    pub architecture: String,

    /// Vocabulary size.
    pub n_vocab: usize,

    /// Number of layers.
    pub n_layers: usize,

    /// Embedding width.
    pub n_embd: usize,

    /// Context length the model was trained with.
    pub n_ctx_train: u32,

    pub params: ModelParams,
}

impl LlamaModel {
    /// Load a model from a GGUF file (llama_model_load_from_file).
    pub fn load(path: &Path, params: ModelParams) -> Result<Self, LlamaError> {
        if !path.exists() {
            return Err(LlamaError::FileNotFound(path.to_path_buf()));
        }

        let header = GgufHeader::read(path)
            .map_err(|e| LlamaError::ModelLoadFailed(format!("{}: {e}", path.display())))?;

        if header.get_str("general.type") == Some("adapter") {
            return Err(LlamaError::ModelLoadFailed(format!(
                "{} is an adapter, not a base model",
                path.display()
            )));
        }

        let architecture = header
            .architecture()
            .ok_or_else(|| {
                LlamaError::ModelLoadFailed("missing general.architecture".to_string())
            })?
            .to_string();

        let required = |key: String| {
            header
                .get_u64(&key)
                .map(|v| v as usize)
                .ok_or(LlamaError::ModelLoadFailed(format!("missing {key}")))
        };
        let n_layers = required(format!("{architecture}.block_count"))?;
        let n_embd = required(format!("{architecture}.embedding_length"))?;

        let n_ctx_train = header
            .get_u64(&format!("{architecture}.context_length"))
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);

        let n_vocab = header
            .get("tokenizer.ggml.tokens")
            .and_then(GgufValue::as_array)
            .map(|tokens| tokens.len())
            .unwrap_or(DEFAULT_VOCAB)
            .max(MIN_VOCAB);

        let model = Self {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            architecture,
            n_vocab,
            n_layers,
            n_embd,
            n_ctx_train,
            params,
        };

        info!(
            path = %model.path.display(),
            arch = model.architecture,
            layers = model.n_layers,
            n_embd = model.n_embd,
            n_ctx_train = model.n_ctx_train,
            use_mmap = model.params.use_mmap,
            use_mlock = model.params.use_mlock,
            "Loaded base model"
        );

        Ok(model)
    }

    /// Graph nodes needed for one decode step without adapters.
    pub fn base_graph_nodes(&self) -> usize {
        GRAPH_BASE_NODES + self.n_layers * GRAPH_NODES_PER_LAYER
    }

    /// Create a new context for this model (llama_init_from_model).
    pub fn new_context(self: &Arc<Self>, params: ContextParams) -> Result<LlamaContext, LlamaError> {
        let n_ctx = if params.n_ctx == 0 {
            self.n_ctx_train
        } else {
            params.n_ctx
        };

        if n_ctx > self.n_ctx_train {
            return Err(LlamaError::ContextFailed(format!(
                "n_ctx {n_ctx} exceeds training context {}",
                self.n_ctx_train
            )));
        }

        if self.base_graph_nodes() > params.graph_node_budget {
            return Err(LlamaError::ContextFailed(format!(
                "model graph needs {} nodes, budget is {}",
                self.base_graph_nodes(),
                params.graph_node_budget
            )));
        }

        Ok(LlamaContext {
            model: Arc::clone(self),
            n_ctx,
            n_batch: params.n_batch,
            n_threads: params.n_threads,
            graph_node_budget: params.graph_node_budget,
            pos: 0,
            adapters: Vec::new(),
        })
    }

    /// Tokenize a string into token IDs (byte-level stand-in vocabulary).
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, LlamaError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(TOKEN_BOS);
        }
        tokens.extend(text.bytes().map(|b| b as TokenId + BYTE_TOKEN_OFFSET));
        Ok(tokens)
    }

    /// Text for a single token; special tokens render as empty.
    pub fn token_to_piece(&self, token: TokenId) -> String {
        match byte_of(token) {
            Some(b) => String::from_utf8_lossy(&[b]).into_owned(),
            None => String::new(),
        }
    }

    /// Decode tokens back to text.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String, LlamaError> {
        let bytes: Vec<u8> = tokens.iter().filter_map(|&t| byte_of(t)).collect();
        String::from_utf8(bytes).map_err(|e| LlamaError::TokenizeFailed(e.to_string()))
    }
}

fn byte_of(token: TokenId) -> Option<u8> {
    let b = token - BYTE_TOKEN_OFFSET;
    u8::try_from(b).ok()
}

/// A loaded LoRA adapter (wraps `*mut llama_adapter_lora`).
///
/// Owned by the model it was loaded against and shared by handle.
#[derive(Debug)]
pub struct LlamaAdapter {
    model_id: u64,
    path: PathBuf,
    alpha: Option<f32>,
    rank: usize,
    lora_pairs: usize,
}

impl LlamaAdapter {
    /// Parse and load a LoRA adapter file (llama_adapter_lora_init).
    pub fn load(model: &LlamaModel, path: &Path) -> Result<Self, LlamaError> {
        if !path.exists() {
            return Err(LlamaError::FileNotFound(path.to_path_buf()));
        }

        let fail = |msg: String| LlamaError::AdapterLoadFailed(format!("{}: {msg}", path.display()));

        let header = GgufHeader::read(path).map_err(|e| fail(e.to_string()))?;

        if header.get_str("general.type") != Some("adapter") {
            return Err(fail("general.type is not 'adapter'".to_string()));
        }
        if header.get_str("adapter.type") != Some("lora") {
            return Err(fail("adapter.type is not 'lora'".to_string()));
        }

        match header.architecture() {
            Some(arch) if arch == model.architecture => {}
            Some(arch) => {
                return Err(fail(format!(
                    "architecture mismatch: adapter is '{arch}', model is '{}'",
                    model.architecture
                )))
            }
            None => return Err(fail("missing general.architecture".to_string())),
        }

        let mut rank = 0;
        let mut lora_pairs = 0;
        for a in header.tensors.iter().filter(|t| t.name.ends_with(".lora_a")) {
            let base = &a.name[..a.name.len() - ".lora_a".len()];
            let b = header
                .tensor(&format!("{base}.lora_b"))
                .ok_or_else(|| fail(format!("missing lora_b for {base}")))?;

            if a.dims.len() != 2 || b.dims.len() != 2 {
                return Err(fail(format!("{base}: LoRA tensors must be 2-D")));
            }
            if a.dims[1] != b.dims[0] {
                return Err(fail(format!(
                    "{base}: rank mismatch (lora_a {}, lora_b {})",
                    a.dims[1], b.dims[0]
                )));
            }
            let is_attn_input = ["attn_q", "attn_k", "attn_v"]
                .iter()
                .any(|n| base.contains(n));
            if is_attn_input && a.dims[0] as usize != model.n_embd {
                return Err(fail(format!(
                    "{base}: input width {} does not match model n_embd {}",
                    a.dims[0], model.n_embd
                )));
            }

            rank = rank.max(a.dims[1] as usize);
            lora_pairs += 1;
        }

        let orphan_b = header.tensors.iter().find(|t| {
            t.name
                .strip_suffix(".lora_b")
                .is_some_and(|base| header.tensor(&format!("{base}.lora_a")).is_none())
        });
        if let Some(t) = orphan_b {
            return Err(fail(format!("missing lora_a for {}", t.name)));
        }

        if lora_pairs == 0 {
            return Err(fail("no LoRA tensors".to_string()));
        }

        let adapter = Self {
            model_id: model.id,
            path: path.to_path_buf(),
            alpha: header.get_f32("adapter.lora.alpha"),
            rank,
            lora_pairs,
        };

        debug!(
            path = %adapter.path.display(),
            rank,
            lora_pairs,
            alpha = ?adapter.alpha,
            "Parsed LoRA adapter"
        );

        Ok(adapter)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn alpha(&self) -> Option<f32> {
        self.alpha
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn lora_pairs(&self) -> usize {
        self.lora_pairs
    }

    /// Extra graph nodes this adapter adds while attached.
    pub fn graph_nodes(&self) -> usize {
        self.lora_pairs * GRAPH_NODES_PER_LORA_PAIR
    }
}

#[derive(Debug)]
struct AttachedAdapter {
    adapter: Arc<LlamaAdapter>,
    scale: f32,
}

/// An inference context (wraps `*mut llama_context`).
#[derive(Debug)]
pub struct LlamaContext {
    model: Arc<LlamaModel>,

    /// Context size.
    pub n_ctx: u32,

    /// Prompt batch size.
    pub n_batch: u32,

    /// Compute threads.
    pub n_threads: u32,

    graph_node_budget: usize,

    /// Current token position.
    pos: usize,

    adapters: Vec<AttachedAdapter>,
}

impl LlamaContext {
    pub fn model(&self) -> &Arc<LlamaModel> {
        &self.model
    }

    pub fn graph_node_budget(&self) -> usize {
        self.graph_node_budget
    }

    /// Estimated graph size for one decode step with the current adapters.
    pub fn graph_nodes(&self) -> usize {
        self.model.base_graph_nodes()
            + self
                .adapters
                .iter()
                .map(|a| a.adapter.graph_nodes())
                .sum::<usize>()
    }

    /// Attach an adapter, or update its scale if already attached
    /// (llama_set_adapter_lora).
    pub fn set_adapter(&mut self, adapter: &Arc<LlamaAdapter>, scale: f32) -> Result<(), LlamaError> {
        if adapter.model_id != self.model.id {
            return Err(LlamaError::AdapterApplyFailed(format!(
                "{} was loaded for a different model",
                adapter.path.display()
            )));
        }

        if let Some(attached) = self
            .adapters
            .iter_mut()
            .find(|a| Arc::ptr_eq(&a.adapter, adapter))
        {
            attached.scale = scale;
            return Ok(());
        }

        let nodes = self.graph_nodes() + adapter.graph_nodes();
        if nodes > self.graph_node_budget {
            return Err(LlamaError::AdapterApplyFailed(format!(
                "computation graph would need {nodes} nodes, budget is {}",
                self.graph_node_budget
            )));
        }

        self.adapters.push(AttachedAdapter {
            adapter: Arc::clone(adapter),
            scale,
        });
        Ok(())
    }

    /// Detach an adapter (llama_rm_adapter_lora).
    pub fn remove_adapter(&mut self, adapter: &LlamaAdapter) -> Result<(), LlamaError> {
        let idx = self
            .adapters
            .iter()
            .position(|a| std::ptr::eq(a.adapter.as_ref(), adapter))
            .ok_or_else(|| {
                LlamaError::AdapterApplyFailed(format!(
                    "{} is not attached to this context",
                    adapter.path.display()
                ))
            })?;
        self.adapters.remove(idx);
        Ok(())
    }

    /// Detach every adapter (llama_clear_adapter_lora).
    pub fn clear_adapters(&mut self) {
        self.adapters.clear();
    }

    /// Scale of an attached adapter.
    pub fn adapter_scale(&self, adapter: &LlamaAdapter) -> Option<f32> {
        self.adapters
            .iter()
            .find(|a| std::ptr::eq(a.adapter.as_ref(), adapter))
            .map(|a| a.scale)
    }

    pub fn attached_adapters(&self) -> usize {
        self.adapters.len()
    }

    /// Process a batch of tokens (llama_decode).
    pub fn decode(&mut self, tokens: &[TokenId]) -> Result<(), LlamaError> {
        if tokens.is_empty() {
            return Err(LlamaError::DecodeFailed("empty batch".to_string()));
        }
        if self.pos + tokens.len() > self.n_ctx as usize {
            return Err(LlamaError::DecodeFailed(format!(
                "context window exhausted ({} + {} > {})",
                self.pos,
                tokens.len(),
                self.n_ctx
            )));
        }
        if self.graph_nodes() > self.graph_node_budget {
            return Err(LlamaError::DecodeFailed(format!(
                "graph overflow ({} > {})",
                self.graph_nodes(),
                self.graph_node_budget
            )));
        }
        self.pos += tokens.len();
        Ok(())
    }

    /// Sample the next token from the last decode.
    ///
    /// Deterministic in the position, seed and the attached adapter set, so
    /// switching adapters visibly changes output. Emits lowercase letters and
    /// spaces only.
    pub fn sample(&self, params: &SamplingParams) -> TokenId {
        let mut hasher = DefaultHasher::new();
        self.pos.hash(&mut hasher);
        params.seed.hash(&mut hasher);
        if params.temperature > 0.0 {
            params.temperature.to_bits().hash(&mut hasher);
        }
        for a in &self.adapters {
            a.adapter.path.hash(&mut hasher);
            a.scale.to_bits().hash(&mut hasher);
        }
        let h = hasher.finish() % 27;
        let byte = if h == 26 { b' ' } else { b'a' + h as u8 };
        byte as TokenId + BYTE_TOKEN_OFFSET
    }

    /// Current KV cache usage in tokens.
    pub fn kv_cache_used(&self) -> usize {
        self.pos
    }

    /// Clear the KV cache.
    pub fn kv_cache_clear(&mut self) {
        self.pos = 0;
    }
}
