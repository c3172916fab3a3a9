//! Adapter registry behavior against a real context.

mod common;

use lora_hotswap::adapters::{AdapterError, AdapterRegistry, AdapterSpec};
use lora_hotswap::inference::llama_ffi::{ContextParams, LlamaContext};

use common::{load_model, write_lora};

fn setup(dir: &std::path::Path, graph_node_budget: usize) -> (AdapterRegistry, LlamaContext) {
    let model = load_model(dir);
    let ctx = model
        .new_context(ContextParams {
            graph_node_budget,
            ..Default::default()
        })
        .unwrap();
    (AdapterRegistry::new(model), ctx)
}

#[test]
fn test_reload_uses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 2);

    reg.load(&mut ctx, &AdapterSpec::new(&pirate, 1.0)).unwrap();
    reg.remove(&mut ctx, "pirate").unwrap();
    assert!(reg.is_empty());
    assert!(reg.is_cached(&pirate));

    // The file is gone, but the cached handle still serves the reload.
    std::fs::remove_file(&pirate).unwrap();
    let info = reg.load(&mut ctx, &AdapterSpec::new(&pirate, 0.5)).unwrap();
    assert_eq!(info.scale, 0.5);

    let stats = reg.stats();
    assert_eq!(stats.parsed, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.active, 1);
    assert_eq!(ctx.attached_adapters(), 1);
}

#[test]
fn test_prune_then_reload_reads_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let a = write_lora(dir.path(), "a.gguf", "llama", 1);
    let b = write_lora(dir.path(), "b.gguf", "llama", 1);

    reg.load(&mut ctx, &AdapterSpec::new(&a, 1.0)).unwrap();
    reg.load(&mut ctx, &AdapterSpec::new(&b, 1.0)).unwrap();
    reg.remove(&mut ctx, "a").unwrap();

    assert_eq!(reg.prune_cache(), 1);
    assert!(!reg.is_cached(&a));
    assert!(reg.is_cached(&b));

    std::fs::remove_file(&a).unwrap();
    let err = reg.load(&mut ctx, &AdapterSpec::new(&a, 1.0)).unwrap_err();
    assert!(matches!(err, AdapterError::FileNotFound(_)));
}

#[test]
fn test_swap_by_name_restores_last_scale() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);
    let poet = write_lora(dir.path(), "poet.gguf", "llama", 1);

    reg.load(&mut ctx, &AdapterSpec::new(&poet, 0.3)).unwrap();
    reg.remove(&mut ctx, "poet").unwrap();
    reg.load(&mut ctx, &AdapterSpec::new(&pirate, 1.0)).unwrap();

    let info = reg.swap(&mut ctx, "pirate", "poet", None, None).unwrap();
    assert_eq!(info.name, "poet");
    assert_eq!(info.scale, 0.3);
    assert_eq!(reg.names(), vec!["poet".to_string()]);
    assert_eq!(ctx.attached_adapters(), 1);
}

#[test]
fn test_swap_by_path_keeps_old_scale() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);
    let poet = write_lora(dir.path(), "poet.gguf", "llama", 1);

    reg.load(&mut ctx, &AdapterSpec::new(&pirate, 0.7)).unwrap();
    let info = reg
        .swap(&mut ctx, "pirate", poet.to_str().unwrap(), None, Some("verse".into()))
        .unwrap();

    assert_eq!(info.name, "verse");
    assert_eq!(info.scale, 0.7);
    assert!(reg.get("pirate").is_none());
}

#[test]
fn test_swap_failure_keeps_old_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);
    let mistral = write_lora(dir.path(), "mistral.gguf", "mistral", 1);

    reg.load(&mut ctx, &AdapterSpec::new(&pirate, 0.9)).unwrap();
    let err = reg
        .swap(&mut ctx, "pirate", mistral.to_str().unwrap(), None, None)
        .unwrap_err();
    assert!(matches!(err, AdapterError::LoadFailed { .. }));

    let active = reg.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "pirate");
    assert_eq!(ctx.adapter_scale(&reg.get("pirate").unwrap().handle), Some(0.9));
}

#[test]
fn test_graph_budget_rejects_extra_adapter() {
    let dir = tempfile::tempdir().unwrap();
    // Base graph is 80 nodes for 2 layers; room for two LoRA pairs.
    let (mut reg, mut ctx) = setup(dir.path(), 88);
    let small = write_lora(dir.path(), "small.gguf", "llama", 1);
    let big = write_lora(dir.path(), "big.gguf", "llama", 2);

    reg.load(&mut ctx, &AdapterSpec::new(&small, 1.0)).unwrap();
    let err = reg.load(&mut ctx, &AdapterSpec::new(&big, 1.0)).unwrap_err();
    assert!(matches!(err, AdapterError::ApplyFailed { .. }));
    assert_eq!(reg.names(), vec!["small".to_string()]);

    // Swapping frees the small adapter's nodes first, so the big one fits.
    let info = reg
        .swap(&mut ctx, "small", big.to_str().unwrap(), None, None)
        .unwrap();
    assert_eq!(info.lora_pairs, 2);
    assert_eq!(ctx.graph_nodes(), 88);
}

#[test]
fn test_clear_all_keeps_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    for name in ["a", "b", "c"] {
        let path = write_lora(dir.path(), &format!("{name}.gguf"), "llama", 1);
        reg.load(&mut ctx, &AdapterSpec::new(path, 1.0)).unwrap();
    }

    assert_eq!(reg.clear_all(&mut ctx), 3);
    assert!(reg.is_empty());
    assert_eq!(ctx.attached_adapters(), 0);
    assert_eq!(reg.stats().cached, 3);
    assert_eq!(reg.clear_all(&mut ctx), 0);
}

#[test]
fn test_path_spellings_share_one_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let a = write_lora(dir.path(), "a.gguf", "llama", 1);
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let dotted = dir.path().join("sub/../a.gguf");

    let info = reg.load(&mut ctx, &AdapterSpec::new(&a, 1.0)).unwrap();
    assert_eq!(info.path, std::fs::canonicalize(&a).unwrap());
    reg.remove(&mut ctx, "a").unwrap();

    let info = reg.load(&mut ctx, &AdapterSpec::new(&dotted, 0.5)).unwrap();
    assert_eq!(info.path, std::fs::canonicalize(&a).unwrap());
    let stats = reg.stats();
    assert_eq!((stats.parsed, stats.cache_hits, stats.cached), (1, 1, 1));

    // Pruning forgets every spelling of the dropped file.
    reg.remove(&mut ctx, "a").unwrap();
    assert_eq!(reg.prune_cache(), 1);
    std::fs::remove_file(&a).unwrap();
    for path in [&a, &dotted] {
        let err = reg.load(&mut ctx, &AdapterSpec::new(path, 1.0)).unwrap_err();
        assert!(matches!(err, AdapterError::FileNotFound(_)));
    }
}

#[test]
fn test_truncated_header_with_huge_tensor_count_is_load_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (mut reg, mut ctx) = setup(dir.path(), 8192);
    let path = dir.path().join("hostile.gguf");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x4655_4747u32.to_le_bytes());
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&(1u64 << 24).to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    let err = reg.load(&mut ctx, &AdapterSpec::new(&path, 1.0)).unwrap_err();
    assert!(matches!(err, AdapterError::LoadFailed { .. }));
    assert!(reg.is_empty());
    assert!(!reg.is_cached(&path));
}
