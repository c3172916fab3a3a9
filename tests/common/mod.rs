//! Shared fixtures: header-only GGUF model and LoRA files.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lora_hotswap::config::Config;
use lora_hotswap::inference::engine::InferenceEngine;
use lora_hotswap::inference::gguf::GgufBuilder;
use lora_hotswap::inference::llama_ffi::{LlamaModel, ModelParams};
use lora_hotswap::metrics::Metrics;

pub const N_EMBD: u32 = 64;

pub fn write_model(dir: &Path, file: &str, arch: &str) -> PathBuf {
    let path = dir.join(file);
    GgufBuilder::new()
        .string("general.architecture", arch)
        .string("general.type", "model")
        .u32(format!("{arch}.block_count"), 2)
        .u32(format!("{arch}.embedding_length"), N_EMBD)
        .u32(format!("{arch}.context_length"), 4096)
        .write_file(&path)
        .unwrap();
    path
}

/// LoRA on `pairs` attention projections, rank 8.
pub fn write_lora(dir: &Path, file: &str, arch: &str, pairs: usize) -> PathBuf {
    let path = dir.join(file);
    let n_in = N_EMBD as u64;
    let mut builder = GgufBuilder::new()
        .string("general.architecture", arch)
        .string("general.type", "adapter")
        .string("adapter.type", "lora")
        .f32("adapter.lora.alpha", 16.0);
    for i in 0..pairs {
        let base = format!("blk.{i}.attn_q.weight");
        builder = builder
            .tensor(format!("{base}.lora_a"), &[n_in, 8])
            .tensor(format!("{base}.lora_b"), &[8, n_in]);
    }
    builder.write_file(&path).unwrap();
    path
}

pub fn load_model(dir: &Path) -> Arc<LlamaModel> {
    let path = write_model(dir, "base.gguf", "llama");
    Arc::new(LlamaModel::load(&path, ModelParams::default()).unwrap())
}

pub fn engine(dir: &Path, config: Config) -> InferenceEngine {
    InferenceEngine::new(load_model(dir), Arc::new(config), Metrics::new().unwrap()).unwrap()
}
