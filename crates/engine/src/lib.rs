//! Stencil overlay engine: expands a kustomize-style manifest source into raw
//! resource documents. The render stage consumes this as a black box; the
//! filesystem is pluggable so tests can render straight from memory.

#![forbid(unsafe_code)]

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

/// Kustomization file names recognized at the root of a source, in lookup order.
pub const KUSTOMIZATION_NAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Canonical kustomization file name; fixtures usually write this one.
pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// Filesystem seam for the engine. Implemented for the real filesystem and for
/// an in-memory map used by tests.
pub trait ManifestFs: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;

    /// Stable form of `path` used for cycle detection. Lexical by default;
    /// disk-backed filesystems also resolve symlinks.
    fn canonical(&self, path: &Path) -> PathBuf {
        normalize(path)
    }
}

/// Lexically resolve `.` and `..` components without touching a filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp.as_os_str());
                }
            }
            _ => out.push(comp.as_os_str()),
        }
    }
    out
}

/// Reads manifests from the process filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFs;

impl ManifestFs for DiskFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn canonical(&self, path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| normalize(path))
    }
}

/// In-memory filesystem. Directories are implicit: any stored path makes its
/// ancestors directories.
#[derive(Default)]
pub struct InMemoryFs {
    files: Mutex<FxHashMap<PathBuf, Vec<u8>>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(normalize(&path.into()), contents.into());
    }
}

impl ManifestFs for InMemoryFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(&normalize(path)) || self.is_dir(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let path = normalize(path);
        let files = self.files.lock().unwrap();
        files.keys().any(|k| *k != path && k.starts_with(&path))
    }
}

/// The subset of a kustomization file the engine understands.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    /// Relative paths to resource files, or to directories holding a nested
    /// kustomization.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Expands a manifest source directory into an ordered list of documents.
pub struct OverlayEngine {
    fs: Arc<dyn ManifestFs>,
}

impl Default for OverlayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayEngine {
    pub fn new() -> Self {
        Self { fs: Arc::new(DiskFs) }
    }

    pub fn with_fs(fs: Arc<dyn ManifestFs>) -> Self {
        Self { fs }
    }

    /// Render the kustomization rooted at `path`.
    ///
    /// Document order follows the kustomization's `resources` order;
    /// multi-document files keep their in-file order. Fails on the first
    /// unreadable or malformed input.
    pub fn render(&self, path: &str) -> Result<Vec<DynamicObject>> {
        let mut out = Vec::new();
        let mut visited = Vec::new();
        self.render_dir(Path::new(path), &mut visited, &mut out)
            .with_context(|| format!("rendering manifest source {path}"))?;
        debug!(path, count = out.len(), "manifest source rendered");
        Ok(out)
    }

    fn render_dir(
        &self,
        dir: &Path,
        visited: &mut Vec<PathBuf>,
        out: &mut Vec<DynamicObject>,
    ) -> Result<()> {
        // Guard against self- or mutually-referencing kustomizations; only the
        // ancestor chain counts, so a base shared by two overlays still renders
        // for each of them.
        let canon = self.fs.canonical(dir);
        if visited.contains(&canon) {
            return Err(anyhow!("kustomization cycle at {}", dir.display()));
        }
        visited.push(canon);
        let kfile = self.find_kustomization(dir)?;
        let bytes = self.fs.read(&kfile)?;
        let kust: Kustomization = serde_yaml::from_slice(&bytes)
            .with_context(|| format!("parsing {}", kfile.display()))?;
        for res in &kust.resources {
            let target = dir.join(res);
            if self.fs.is_dir(&target) {
                self.render_dir(&target, visited, out)?;
            } else {
                self.render_file(&target, out)?;
            }
        }
        visited.pop();
        Ok(())
    }

    fn find_kustomization(&self, dir: &Path) -> Result<PathBuf> {
        for name in KUSTOMIZATION_NAMES {
            let cand = dir.join(name);
            if self.fs.exists(&cand) && !self.fs.is_dir(&cand) {
                return Ok(cand);
            }
        }
        Err(anyhow!("no kustomization file under {}", dir.display()))
    }

    fn render_file(&self, path: &Path, out: &mut Vec<DynamicObject>) -> Result<()> {
        let bytes = self.fs.read(path)?;
        let text = std::str::from_utf8(&bytes)
            .with_context(|| format!("{} is not utf-8", path.display()))?;
        for doc in serde_yaml::Deserializer::from_str(text) {
            let value = serde_json::Value::deserialize(doc)
                .with_context(|| format!("parsing {}", path.display()))?;
            if value.is_null() {
                // Empty documents (e.g. trailing "---") are not resources
                continue;
            }
            out.push(to_object(value).with_context(|| format!("in {}", path.display()))?);
        }
        Ok(())
    }
}

/// Convert a raw document into a `DynamicObject`. A missing or null `metadata`
/// section is initialized to an empty map rather than rejected; downstream
/// metadata stamping assumes the section exists.
fn to_object(mut value: serde_json::Value) -> Result<DynamicObject> {
    let map = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("document is not a mapping"))?;
    if !matches!(map.get("metadata"), Some(serde_json::Value::Object(_))) {
        map.insert("metadata".into(), serde_json::Value::Object(Default::default()));
    }
    serde_json::from_value(value).context("decoding resource document")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_engine() -> (Arc<InMemoryFs>, OverlayEngine) {
        let fs = Arc::new(InMemoryFs::new());
        let engine = OverlayEngine::with_fs(fs.clone());
        (fs, engine)
    }

    #[test]
    fn renders_resources_in_kustomization_order() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/kustomization.yaml", "resources:\n- b.yaml\n- a.yaml\n");
        fs.write_file("app/a.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n");
        fs.write_file("app/b.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n");

        let objs = engine.render("app").unwrap();
        let names: Vec<_> = objs.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn multi_document_files_keep_in_file_order() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/kustomization.yaml", "resources:\n- all.yaml\n");
        fs.write_file(
            "app/all.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: one\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: two\n---\n",
        );

        let objs = engine.render("app").unwrap();
        let names: Vec<_> = objs.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn nested_directories_recurse() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/kustomization.yaml", "resources:\n- cm.yaml\n- base\n");
        fs.write_file("app/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: top\n");
        fs.write_file("app/base/kustomization.yaml", "resources:\n- cm.yaml\n");
        fs.write_file("app/base/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: nested\n");

        let objs = engine.render("app").unwrap();
        let names: Vec<_> = objs.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["top", "nested"]);
    }

    #[test]
    fn missing_metadata_is_initialized() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/kustomization.yaml", "resources:\n- cm.yaml\n");
        fs.write_file("app/cm.yaml", "apiVersion: v1\nkind: ConfigMap\ndata:\n  k: v\n");

        let objs = engine.render("app").unwrap();
        assert_eq!(objs.len(), 1);
        assert!(objs[0].metadata.name.is_none());
        assert_eq!(objs[0].data.get("data").and_then(|d| d.get("k")).and_then(|v| v.as_str()), Some("v"));
    }

    #[test]
    fn missing_kustomization_names_the_source() {
        let (_fs, engine) = mem_engine();
        let err = engine.render("nowhere").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("rendering manifest source nowhere"), "msg={msg}");
        assert!(msg.contains("no kustomization file"), "msg={msg}");
    }

    #[test]
    fn scalar_document_is_a_structural_error() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/kustomization.yaml", "resources:\n- bad.yaml\n");
        fs.write_file("app/bad.yaml", "just a string\n");

        let err = engine.render("app").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("not a mapping"), "msg={msg}");
        assert!(msg.contains("bad.yaml"), "msg={msg}");
    }

    #[test]
    fn self_referencing_kustomization_is_an_error() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/kustomization.yaml", "resources:\n- .\n");

        let err = engine.render("app").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("kustomization cycle"), "msg={msg}");
    }

    #[test]
    fn mutually_referencing_directories_are_an_error() {
        let (fs, engine) = mem_engine();
        fs.write_file("root/a/kustomization.yaml", "resources:\n- ../b\n");
        fs.write_file("root/b/kustomization.yaml", "resources:\n- ../a\n");

        let err = engine.render("root/a").unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("kustomization cycle"), "msg={msg}");
        assert!(msg.contains("root/a"), "msg={msg}");
    }

    #[test]
    fn base_shared_by_two_overlays_renders_for_each() {
        let (fs, engine) = mem_engine();
        fs.write_file("root/kustomization.yaml", "resources:\n- left\n- right\n");
        fs.write_file("root/left/kustomization.yaml", "resources:\n- ../base\n");
        fs.write_file("root/right/kustomization.yaml", "resources:\n- ../base\n");
        fs.write_file("root/base/kustomization.yaml", "resources:\n- cm.yaml\n");
        fs.write_file("root/base/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: shared\n");

        let objs = engine.render("root").unwrap();
        let names: Vec<_> = objs.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["shared", "shared"]);
    }

    #[test]
    fn alternate_kustomization_names_are_accepted() {
        let (fs, engine) = mem_engine();
        fs.write_file("app/Kustomization", "resources:\n- cm.yaml\n");
        fs.write_file("app/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: alt\n");

        let objs = engine.render("app").unwrap();
        assert_eq!(objs.len(), 1);
    }
}
