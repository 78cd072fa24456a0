//! Stencil render action: expands every manifest source of a reconciliation
//! request, stamps ownership metadata, and caches renders per owner identity.
//!
//! Caching is keyed by a pluggable function of the request and source. The
//! owner's generation is deliberately not part of the key: it is stored next
//! to each cache entry and compared on lookup, so the key answers "which
//! manifest for which owner" while the generation alone governs freshness.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

use stencil_core::{ManifestSource, ReconciliationRequest};
use stencil_engine::{ManifestFs, OverlayEngine};

/// Pluggable cache key: stable for inputs that may reuse a cached render,
/// distinct for inputs that must not.
pub type CachingKeyFn =
    Arc<dyn Fn(&ReconciliationRequest, &ManifestSource) -> String + Send + Sync>;

/// Default key: owner identity plus source path (`Kind/name@path`).
pub fn default_caching_key(rr: &ReconciliationRequest, manifest: &ManifestSource) -> String {
    format!("{}@{}", rr.instance.identity(), manifest.path)
}

/// Counts resources produced by actual renders. Cache hits never count, so the
/// value tracks rendering cost, not request volume.
#[derive(Debug, Default)]
pub struct RenderMetrics {
    rendered: AtomicU64,
}

impl RenderMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(&self, n: usize) {
        self.rendered.fetch_add(n as u64, Ordering::Relaxed);
        counter!("render_manifests_rendered_total", n as u64);
    }

    /// Total resources rendered (not cache-served) since construction.
    pub fn rendered_total(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }
}

struct CacheEntry {
    generation: i64,
    /// Engine output before metadata injection; stamped fresh on every use.
    resources: Vec<DynamicObject>,
}

/// Identity-keyed store of the last render per key. No eviction; entries live
/// as long as the cache itself.
#[derive(Default)]
pub struct RenderCache {
    entries: Mutex<FxHashMap<String, CacheEntry>>,
}

impl RenderCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only lookup, ignoring generation. Returns the stored generation
    /// and a copy of the stored (pre-injection) resources.
    pub fn lookup(&self, key: &str) -> Option<(i64, Vec<DynamicObject>)> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(|e| (e.generation, e.resources.clone()))
    }

    /// Return the cached resources for `(key, generation)`, or invoke
    /// `render_fn` and replace the entry.
    ///
    /// The check-render-store sequence runs under the cache lock, so two
    /// concurrent callers on the same unchanged key render at most once.
    /// Renders block only on local file reads, so holding the lock across the
    /// call is acceptable. A failed render writes nothing and leaves any
    /// previous entry in place.
    fn get_or_render<F>(
        &self,
        key: &str,
        generation: i64,
        metrics: &RenderMetrics,
        render_fn: F,
    ) -> Result<Vec<DynamicObject>>
    where
        F: FnOnce() -> Result<Vec<DynamicObject>>,
    {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(key) {
            if entry.generation == generation {
                debug!(key, generation, "render cache hit");
                return Ok(entry.resources.clone());
            }
            debug!(key, stored = entry.generation, current = generation, "render cache stale");
        }
        let resources = render_fn()?;
        metrics.add(resources.len());
        entries.insert(key.to_string(), CacheEntry { generation, resources: resources.clone() });
        Ok(resources)
    }
}

/// Construction-time options for [`RenderAction`]. Every field is optional;
/// the zero value renders uncached with no extra metadata.
#[derive(Clone, Default)]
pub struct RenderConfig {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    caching: Option<CachingKeyFn>,
    engine_fs: Option<Arc<dyn ManifestFs>>,
    cache: Option<Arc<RenderCache>>,
}

impl RenderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label stamped on every rendered resource, overwriting any same-named
    /// label from the source manifest.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Annotation stamped on every rendered resource, overwriting any
    /// same-named annotation from the source manifest.
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Enable caching with the given key function. Without this, every call
    /// renders.
    pub fn caching(mut self, key_fn: CachingKeyFn) -> Self {
        self.caching = Some(key_fn);
        self
    }

    /// Enable caching with [`default_caching_key`].
    pub fn caching_default(self) -> Self {
        self.caching(Arc::new(default_caching_key))
    }

    /// Substitute the engine's filesystem (tests render from memory).
    pub fn engine_fs(mut self, fs: Arc<dyn ManifestFs>) -> Self {
        self.engine_fs = Some(fs);
        self
    }

    /// Share a cache across actions instead of owning a fresh one. Entries
    /// hold pre-injection documents, so actions with different label or
    /// annotation sets can safely share.
    pub fn cache(mut self, cache: Arc<RenderCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// The render stage. One instance is shared by the outer loop's workers; the
/// cache and the metrics handle are the only cross-request state.
pub struct RenderAction {
    engine: OverlayEngine,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    caching: Option<CachingKeyFn>,
    cache: Arc<RenderCache>,
    metrics: Arc<RenderMetrics>,
}

impl RenderAction {
    pub fn new(config: RenderConfig) -> Self {
        Self::with_metrics(config, RenderMetrics::new())
    }

    /// Like [`RenderAction::new`] but with a caller-owned metrics handle, so
    /// callers (and tests) can observe render counts without a global
    /// recorder.
    pub fn with_metrics(config: RenderConfig, metrics: Arc<RenderMetrics>) -> Self {
        let engine = match config.engine_fs {
            Some(fs) => OverlayEngine::with_fs(fs),
            None => OverlayEngine::new(),
        };
        Self {
            engine,
            labels: config.labels,
            annotations: config.annotations,
            caching: config.caching,
            cache: config.cache.unwrap_or_else(RenderCache::new),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RenderMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    /// Render every manifest source of `rr` in order and append the stamped
    /// resources to `rr.resources`.
    ///
    /// Output is at-least-partial, not transactional: the first failing source
    /// aborts the call, but resources appended from earlier successful sources
    /// remain in `rr.resources`.
    pub fn run(&self, rr: &mut ReconciliationRequest) -> Result<()> {
        for idx in 0..rr.manifests.len() {
            let manifest = rr.manifests[idx].clone();
            let mut resources = self
                .render_source(rr, &manifest)
                .with_context(|| format!("rendering manifests at {}", manifest.path))?;
            for obj in resources.iter_mut() {
                inject_metadata(obj, &rr.namespace, &self.labels, &self.annotations);
            }
            rr.resources.append(&mut resources);
        }
        Ok(())
    }

    fn render_source(
        &self,
        rr: &ReconciliationRequest,
        manifest: &ManifestSource,
    ) -> Result<Vec<DynamicObject>> {
        match &self.caching {
            Some(key_fn) => {
                let key = key_fn(rr, manifest);
                self.cache.get_or_render(&key, rr.instance.generation, &self.metrics, || {
                    self.engine.render(&manifest.path)
                })
            }
            None => {
                let resources = self.engine.render(&manifest.path)?;
                self.metrics.add(resources.len());
                Ok(resources)
            }
        }
    }
}

/// Stamp ownership metadata onto a rendered document: the target namespace
/// always wins, configured labels and annotations overwrite same-named keys,
/// everything else is left untouched.
///
/// Runs on cached and fresh documents alike; the stamped values come from the
/// current request and configuration, which may differ between calls sharing a
/// cache entry.
pub fn inject_metadata(
    obj: &mut DynamicObject,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) {
    obj.metadata.namespace = Some(namespace.to_string());
    if !labels.is_empty() {
        let target = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in labels {
            target.insert(k.clone(), v.clone());
        }
    }
    if !annotations.is_empty() {
        let target = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (k, v) in annotations {
            target.insert(k.clone(), v.clone());
        }
    }
}
