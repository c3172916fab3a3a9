//! Adapter records and request types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::inference::llama_ffi::LlamaAdapter;

fn default_scale() -> f32 {
    1.0
}

/// What to load: a LoRA file, the scale to apply it at, and the name it is
/// registered under (defaults to the file stem).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub path: PathBuf,

    #[serde(default = "default_scale")]
    pub scale: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AdapterSpec {
    pub fn new(path: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Registered name: explicit name, else the file stem.
    pub fn resolved_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => name_from_path(&self.path),
        }
    }
}

pub(crate) fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Parses `PATH` or `PATH@SCALE`.
impl FromStr for AdapterSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty adapter path".to_string());
        }
        if let Some((path, scale)) = s.rsplit_once('@') {
            if let Ok(scale) = scale.parse::<f32>() {
                if path.is_empty() {
                    return Err(format!("missing path in '{s}'"));
                }
                return Ok(Self::new(path, scale));
            }
        }
        Ok(Self::new(s, default_scale()))
    }
}

/// An active adapter: registered name, source, scale and engine handle.
#[derive(Debug, Clone)]
pub struct AdapterRecord {
    pub name: String,
    pub path: PathBuf,
    pub scale: f32,
    pub handle: Arc<LlamaAdapter>,
}

impl AdapterRecord {
    pub fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            path: self.path.clone(),
            scale: self.scale,
            rank: self.handle.rank(),
            lora_pairs: self.handle.lora_pairs(),
            alpha: self.handle.alpha(),
        }
    }
}

/// Serializable view of an active adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub path: PathBuf,
    pub scale: f32,
    pub rank: usize,
    pub lora_pairs: usize,
    pub alpha: Option<f32>,
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Adapter files parsed by the engine.
    pub parsed: u64,
    /// Loads served from the handle cache.
    pub cache_hits: u64,
    /// Successful attach/rescale calls.
    pub applies: u64,
    /// Successful detaches (including clears).
    pub detaches: u64,
    /// Handles currently cached.
    pub cached: usize,
    /// Adapters currently active.
    pub active: usize,
}
