//! Prometheus metrics for adapter operations and generation.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::adapters::AdapterError;

/// Metric handles plus the registry they are registered in.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Adapter operations by `op` and `outcome`.
    pub adapter_ops: IntCounterVec,

    /// Adapter files parsed by the engine.
    pub adapter_parses: IntCounter,

    /// Loads served from the handle cache.
    pub adapter_cache_hits: IntCounter,

    /// Adapters currently applied to the context.
    pub active_adapters: IntGauge,

    pub generations: IntCounter,

    pub generated_tokens: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("lora_hotswap".to_string()), None)?;

        let adapter_ops = IntCounterVec::new(
            Opts::new("adapter_operations_total", "Adapter registry operations"),
            &["op", "outcome"],
        )?;
        let adapter_parses = IntCounter::new(
            "adapter_parses_total",
            "Adapter files parsed by the engine",
        )?;
        let adapter_cache_hits = IntCounter::new(
            "adapter_cache_hits_total",
            "Adapter loads served from the handle cache",
        )?;
        let active_adapters = IntGauge::new("active_adapters", "Adapters applied to the context")?;
        let generations = IntCounter::new("generations_total", "Generations run")?;
        let generated_tokens = IntCounter::new("generated_tokens_total", "Tokens generated")?;

        registry.register(Box::new(adapter_ops.clone()))?;
        registry.register(Box::new(adapter_parses.clone()))?;
        registry.register(Box::new(adapter_cache_hits.clone()))?;
        registry.register(Box::new(active_adapters.clone()))?;
        registry.register(Box::new(generations.clone()))?;
        registry.register(Box::new(generated_tokens.clone()))?;

        Ok(Self {
            registry,
            adapter_ops,
            adapter_parses,
            adapter_cache_hits,
            active_adapters,
            generations,
            generated_tokens,
        })
    }

    /// Count one registry operation.
    pub fn record_op<T>(&self, op: &str, result: &Result<T, AdapterError>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(AdapterError::FileNotFound(_)) => "file_not_found",
            Err(AdapterError::LoadFailed { .. }) => "load_failed",
            Err(AdapterError::ApplyFailed { .. }) => "apply_failed",
            Err(AdapterError::NotFound(_)) => "not_found",
            Err(AdapterError::AlreadyActive { .. }) => "already_active",
            Err(AdapterError::InvalidScale(_) | AdapterError::InvalidName(_)) => "invalid",
        };
        self.adapter_ops.with_label_values(&[op, outcome]).inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics.record_op("load", &Ok::<(), AdapterError>(()));
        metrics.record_op::<()>("remove", &Err(AdapterError::NotFound("x".into())));
        metrics.active_adapters.set(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("lora_hotswap_adapter_operations_total{op=\"load\",outcome=\"ok\"} 1"));
        assert!(text.contains("outcome=\"not_found\""));
        assert!(text.contains("lora_hotswap_active_adapters 2"));
    }

    #[test]
    fn test_conflict_has_own_outcome() {
        let metrics = Metrics::new().unwrap();
        let conflict = AdapterError::AlreadyActive {
            name: "second".into(),
            existing: "first".into(),
        };
        metrics.record_op::<()>("load", &Err(conflict));
        metrics.record_op::<()>("load", &Err(AdapterError::InvalidScale(f32::NAN)));

        let text = metrics.render().unwrap();
        assert!(text.contains("{op=\"load\",outcome=\"already_active\"} 1"));
        assert!(text.contains("{op=\"load\",outcome=\"invalid\"} 1"));
    }
}
