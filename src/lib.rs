//! lora-hotswap: LoRA adapter hot-swapping for llama.cpp-style inference.
//!
//! Keeps a base model loaded and lets clients attach, rescale, swap and
//! detach LoRA adapters between requests without reloading the model:
//!   adapter file → parsed handle (cached) → applied to the context (active)
//!
//! Exposes an OpenAI-compatible HTTP API plus an adapter control plane.

pub mod adapters;
pub mod config;
pub mod inference;
pub mod metrics;
pub mod prompt;
pub mod server;
