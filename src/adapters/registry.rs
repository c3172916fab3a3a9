//! Adapter registry: named LoRA adapters against one inference context.
//!
//! The registry keeps three maps:
//! - `active`: name → record, mirroring exactly what is attached to the context
//! - `cache`: canonical source path → loaded handle, so reactivation never
//!   re-parses, however the path was spelled
//! - `library`: name → last spec activated under that name, for swap-by-name
//!
//! Every active handle is also in `cache`. After any call returns, success or
//! failure, `active` and the context's attached set agree.
//!
//! The registry does not lock anything itself; callers serialize access to
//! it together with the context (see [`crate::inference::engine`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::adapters::types::{name_from_path, AdapterInfo, AdapterRecord, AdapterSpec, RegistryStats};
use crate::inference::llama_ffi::{LlamaAdapter, LlamaContext, LlamaError, LlamaModel};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Adapter file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to load adapter {}: {reason}", path.display())]
    LoadFailed { path: PathBuf, reason: String },

    #[error("Failed to apply adapter '{name}': {reason}")]
    ApplyFailed { name: String, reason: String },

    #[error("Adapter not active: {0}")]
    NotFound(String),

    #[error("Adapter '{name}' is already active as '{existing}'")]
    AlreadyActive { name: String, existing: String },

    #[error("Invalid adapter scale: {0}")]
    InvalidScale(f32),

    #[error("Invalid adapter name: {0:?}")]
    InvalidName(String),
}

impl AdapterError {
    fn apply_failed(name: &str, err: LlamaError) -> Self {
        AdapterError::ApplyFailed {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

fn validate_scale(scale: f32) -> Result<(), AdapterError> {
    if !scale.is_finite() {
        return Err(AdapterError::InvalidScale(scale));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), AdapterError> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(AdapterError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// The adapter registry for one base model.
pub struct AdapterRegistry {
    model: Arc<LlamaModel>,
    active: HashMap<String, AdapterRecord>,
    cache: HashMap<PathBuf, Arc<LlamaAdapter>>,
    /// Every spelling seen for a cached file → its canonical path.
    aliases: HashMap<PathBuf, PathBuf>,
    library: HashMap<String, AdapterSpec>,
    stats: RegistryStats,
}

impl AdapterRegistry {
    pub fn new(model: Arc<LlamaModel>) -> Self {
        Self {
            model,
            active: HashMap::new(),
            cache: HashMap::new(),
            aliases: HashMap::new(),
            library: HashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    /// Load an adapter and activate it on `ctx`.
    ///
    /// A cached handle for `spec.path` is reused without touching storage.
    /// Loading under a name that is already active replaces that adapter.
    pub fn load(
        &mut self,
        ctx: &mut LlamaContext,
        spec: &AdapterSpec,
    ) -> Result<AdapterInfo, AdapterError> {
        let name = spec.resolved_name();
        validate_name(&name)?;
        validate_scale(spec.scale)?;

        let (path, handle) = self.resolve(&spec.path)?;
        let replacing = self.active.contains_key(&name).then(|| name.clone());
        self.activate(ctx, name, path, handle, spec.scale, replacing.as_deref())
    }

    /// Detach an active adapter. Its cache entry is kept.
    pub fn remove(&mut self, ctx: &mut LlamaContext, name: &str) -> Result<AdapterInfo, AdapterError> {
        let record = self
            .active
            .get(name)
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))?;

        ctx.remove_adapter(&record.handle)
            .map_err(|e| AdapterError::apply_failed(name, e))?;

        let info = record.info();
        self.active.remove(name);
        self.stats.detaches += 1;

        info!(adapter = name, "Removed adapter");
        Ok(info)
    }

    /// Re-apply an active adapter at a new scale.
    pub fn update_scale(
        &mut self,
        ctx: &mut LlamaContext,
        name: &str,
        scale: f32,
    ) -> Result<AdapterInfo, AdapterError> {
        validate_scale(scale)?;

        let record = self
            .active
            .get_mut(name)
            .ok_or_else(|| AdapterError::NotFound(name.to_string()))?;

        ctx.set_adapter(&record.handle, scale)
            .map_err(|e| AdapterError::apply_failed(name, e))?;

        let previous = record.scale;
        record.scale = scale;
        self.stats.applies += 1;
        if let Some(spec) = self.library.get_mut(name) {
            spec.scale = scale;
        }

        info!(adapter = name, previous, scale, "Updated adapter scale");
        Ok(record.info())
    }

    /// Detach every active adapter. Returns how many were detached.
    pub fn clear_all(&mut self, ctx: &mut LlamaContext) -> usize {
        let n = self.active.len();
        ctx.clear_adapters();
        self.active.clear();
        self.stats.detaches += n as u64;

        if n > 0 {
            info!(cleared = n, "Cleared all adapters");
        }
        n
    }

    /// Replace `old` with `target` in one step.
    ///
    /// `target` is looked up as a known adapter name first, then treated as a
    /// path. The scale defaults to the known adapter's last scale, or to
    /// `old`'s scale for a path. If the replacement cannot be loaded or
    /// applied, `old` stays active at its original scale.
    pub fn swap(
        &mut self,
        ctx: &mut LlamaContext,
        old: &str,
        target: &str,
        scale: Option<f32>,
        name: Option<String>,
    ) -> Result<AdapterInfo, AdapterError> {
        let old_scale = self
            .active
            .get(old)
            .map(|r| r.scale)
            .ok_or_else(|| AdapterError::NotFound(old.to_string()))?;

        let (path, default_scale, default_name) = match self.library.get(target) {
            Some(known) => (known.path.clone(), known.scale, target.to_string()),
            None => {
                let path = PathBuf::from(target);
                let name = name_from_path(&path);
                (path, old_scale, name)
            }
        };

        let name = name.unwrap_or(default_name);
        let scale = scale.unwrap_or(default_scale);
        validate_name(&name)?;
        validate_scale(scale)?;

        if name != old {
            if let Some(existing) = self.active.get(&name) {
                return Err(AdapterError::AlreadyActive {
                    name,
                    existing: existing.name.clone(),
                });
            }
        }

        let (path, handle) = self.resolve(&path)?;
        let info = self.activate(ctx, name, path, handle, scale, Some(old))?;

        info!(from = old, to = info.name, scale, "Swapped adapter");
        Ok(info)
    }

    /// Drop cached handles that are not active. Returns how many were dropped.
    pub fn prune_cache(&mut self) -> usize {
        let active = &self.active;
        let before = self.cache.len();
        self.cache
            .retain(|_, handle| active.values().any(|r| Arc::ptr_eq(&r.handle, handle)));
        let pruned = before - self.cache.len();
        let cache = &self.cache;
        self.aliases.retain(|_, canonical| cache.contains_key(canonical));

        if pruned > 0 {
            debug!(pruned, remaining = self.cache.len(), "Pruned adapter cache");
        }
        pruned
    }

    /// Active adapters, sorted by name.
    pub fn active(&self) -> Vec<AdapterInfo> {
        let mut list: Vec<AdapterInfo> = self.active.values().map(AdapterRecord::info).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get(&self, name: &str) -> Option<&AdapterRecord> {
        self.active.get(name)
    }

    /// Active adapter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_cached(&self, path: &Path) -> bool {
        self.aliases
            .get(path)
            .cloned()
            .or_else(|| std::fs::canonicalize(path).ok())
            .is_some_and(|canonical| self.cache.contains_key(&canonical))
    }

    /// Last spec activated under `name`, active or not.
    pub fn known(&self, name: &str) -> Option<&AdapterSpec> {
        self.library.get(name)
    }

    pub fn model(&self) -> &Arc<LlamaModel> {
        &self.model
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            cached: self.cache.len(),
            active: self.active.len(),
            ..self.stats
        }
    }

    /// Canonical path and cached handle for `path`, parsing the file on a miss.
    ///
    /// A spelling seen before still resolves after the file is deleted, as
    /// long as its handle is cached.
    fn resolve(&mut self, path: &Path) -> Result<(PathBuf, Arc<LlamaAdapter>), AdapterError> {
        let canonical = match std::fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self
                .aliases
                .get(path)
                .cloned()
                .ok_or_else(|| AdapterError::FileNotFound(path.to_path_buf()))?,
            Err(e) => {
                return Err(AdapterError::LoadFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        if let Some(handle) = self.cache.get(&canonical) {
            let handle = Arc::clone(handle);
            self.stats.cache_hits += 1;
            self.aliases.insert(path.to_path_buf(), canonical.clone());
            debug!(path = %canonical.display(), "Adapter cache hit");
            return Ok((canonical, handle));
        }

        let adapter = LlamaAdapter::load(&self.model, &canonical).map_err(|e| match e {
            LlamaError::FileNotFound(p) => AdapterError::FileNotFound(p),
            other => AdapterError::LoadFailed {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        self.stats.parsed += 1;
        let handle = Arc::new(adapter);
        self.cache.insert(canonical.clone(), Arc::clone(&handle));
        self.aliases.insert(path.to_path_buf(), canonical.clone());
        self.aliases.insert(canonical.clone(), canonical.clone());
        debug!(path = %handle.path().display(), "Adapter loaded into cache");
        Ok((canonical, handle))
    }

    /// Attach `handle` as `name`, detaching the `replacing` entry first.
    ///
    /// On apply failure the replaced adapter is re-attached at its old scale.
    fn activate(
        &mut self,
        ctx: &mut LlamaContext,
        name: String,
        path: PathBuf,
        handle: Arc<LlamaAdapter>,
        scale: f32,
        replacing: Option<&str>,
    ) -> Result<AdapterInfo, AdapterError> {
        if let Some(other) = self
            .active
            .values()
            .find(|r| Arc::ptr_eq(&r.handle, &handle) && Some(r.name.as_str()) != replacing)
        {
            return Err(AdapterError::AlreadyActive {
                name,
                existing: other.name.clone(),
            });
        }

        let displaced = replacing.and_then(|n| self.active.get(n)).cloned();
        let detached = match &displaced {
            Some(old) if !Arc::ptr_eq(&old.handle, &handle) => {
                ctx.remove_adapter(&old.handle)
                    .map_err(|e| AdapterError::apply_failed(&old.name, e))?;
                true
            }
            _ => false,
        };

        if let Err(e) = ctx.set_adapter(&handle, scale) {
            if let (true, Some(old)) = (detached, &displaced) {
                if let Err(rollback) = ctx.set_adapter(&old.handle, old.scale) {
                    error!(adapter = old.name, error = %rollback, "Failed to restore adapter");
                    self.active.remove(&old.name);
                }
            }
            return Err(AdapterError::apply_failed(&name, e));
        }

        self.stats.applies += 1;
        if let Some(old) = &displaced {
            if detached {
                self.stats.detaches += 1;
            }
            self.active.remove(&old.name);
        }

        let record = AdapterRecord {
            name: name.clone(),
            path: path.clone(),
            scale,
            handle,
        };
        let info = record.info();
        self.active.insert(name.clone(), record);
        self.library.insert(
            name.clone(),
            AdapterSpec {
                path,
                scale,
                name: Some(name),
            },
        );

        info!(
            adapter = info.name,
            path = %info.path.display(),
            scale,
            rank = info.rank,
            active = self.active.len(),
            "Activated adapter"
        );
        Ok(info)
    }
}
