//! LoRA adapter lifecycle management.
//!
//! - [`registry`]: Load/cache/activate/rescale/swap/clear against a context
//! - [`types`]: Adapter specs, records and statistics

pub mod registry;
pub mod types;

pub use registry::{AdapterError, AdapterRegistry};
pub use types::{AdapterInfo, AdapterRecord, AdapterSpec, RegistryStats};
