//! Runtime configuration for lora-hotswap.
//!
//! Configuration is loaded from a JSON file (missing fields take defaults) and
//! then overridden by command-line flags. Adapter presets and personas are
//! plain records here; the registry turns them into live adapters.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::adapters::AdapterSpec;
use crate::inference::llama_ffi::{
    ContextParams, ModelParams, SamplingParams, DEFAULT_GRAPH_NODE_BUDGET,
};
use crate::prompt::ChatTemplate;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "lora-hotswap", about = "LLM inference server with hot-swappable LoRA adapters")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Base model GGUF file (overrides the config file).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Adapter to activate at startup, as PATH or PATH@SCALE. Repeatable.
    #[arg(long = "lora", value_name = "PATH[@SCALE]")]
    pub lora: Vec<AdapterSpec>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Generation defaults.
    pub generation: GenerationConfig,

    /// Adapters activated at startup.
    pub adapters: AdaptersConfig,

    /// Named adapter presets with their own system prompt.
    pub personas: Vec<PersonaConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 16,
            request_timeout_secs: 300,
        }
    }
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Number of GPU layers to offload (-1 = all).
    pub n_gpu_layers: i32,

    /// Context size in tokens (0 = model's training context).
    pub context_size: u32,

    /// Prompt batch size.
    pub n_batch: u32,

    /// Compute threads.
    pub n_threads: u32,

    /// Static computation graph capacity of the engine, in nodes.
    pub graph_node_budget: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            n_gpu_layers: -1,
            context_size: 0,
            n_batch: 512,
            n_threads: 4,
            graph_node_budget: DEFAULT_GRAPH_NODE_BUDGET,
        }
    }
}

/// Defaults applied to completion requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
    pub chat_template: ChatTemplate,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            seed: 0,
            chat_template: ChatTemplate::ChatMl,
        }
    }
}

/// Startup adapter list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub preload: Vec<AdapterSpec>,
}

fn default_persona_scale() -> f32 {
    1.0
}

/// A persona: one adapter at a fixed scale plus the system prompt that goes
/// with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,

    /// LoRA adapter file.
    pub adapter: PathBuf,

    #[serde(default = "default_persona_scale")]
    pub scale: f32,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl PersonaConfig {
    /// The adapter is registered under the persona's name.
    pub fn adapter_spec(&self) -> AdapterSpec {
        AdapterSpec::new(&self.adapter, self.scale).named(&self.name)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(model) = &cli.model {
            self.model.model_path = model.clone();
        }
        self.adapters.preload.extend(cli.lora.iter().cloned());
    }

    /// Reject settings the engine or registry would refuse later.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_concurrent_requests == 0 {
            bail!("server.max_concurrent_requests must be at least 1");
        }
        if !(self.generation.temperature >= 0.0 && self.generation.temperature.is_finite()) {
            bail!("generation.temperature must be a non-negative number");
        }
        if !(self.generation.top_p > 0.0 && self.generation.top_p <= 1.0) {
            bail!("generation.top_p must be in (0, 1]");
        }
        for spec in &self.adapters.preload {
            if !spec.scale.is_finite() {
                bail!("adapter {} has a non-finite scale", spec.path.display());
            }
        }

        let mut names = HashSet::new();
        for persona in &self.personas {
            if persona.name.trim().is_empty() {
                bail!("persona with empty name");
            }
            if !names.insert(persona.name.as_str()) {
                bail!("duplicate persona '{}'", persona.name);
            }
            if !persona.scale.is_finite() {
                bail!("persona '{}' has a non-finite scale", persona.name);
            }
        }
        Ok(())
    }

    pub fn persona(&self, name: &str) -> Option<&PersonaConfig> {
        self.personas.iter().find(|p| p.name == name)
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            n_gpu_layers: self.model.n_gpu_layers,
            ..Default::default()
        }
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            n_ctx: self.model.context_size,
            n_batch: self.model.n_batch,
            n_threads: self.model.n_threads,
            graph_node_budget: self.model.graph_node_budget,
        }
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            seed: self.generation.seed,
        }
    }
}
