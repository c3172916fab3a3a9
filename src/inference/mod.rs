//! Inference engine host.
//!
//! - [`engine`]: Exclusive-access boundary around the single inference context
//! - [`llama_ffi`]: Bindings to the llama.cpp model/context/adapter API
//! - [`gguf`]: GGUF container header reading

pub mod engine;
pub mod gguf;
pub mod llama_ffi;
