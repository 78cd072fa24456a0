//! Stencil core types: the reconciliation request and its manifest sources.

#![forbid(unsafe_code)]

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// Reference to the owning instance of a reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRef {
    pub kind: String,
    pub name: String,
    /// The owner's `metadata.generation`: bumped whenever desired state
    /// changes. Freshness check for cached renders.
    pub generation: i64,
}

impl InstanceRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into(), generation: 0 }
    }

    /// Stable identity discriminator: `kind/name`. The generation is left out
    /// so identity survives spec changes on the same owner.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Release/distribution the owner belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub version: Option<String>,
}

/// A location the overlay engine can expand into zero or more documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestSource {
    pub path: String,
}

impl ManifestSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Per-cycle unit of work. Owned by the outer reconciliation loop; the render
/// stage reads everything and appends to `resources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRequest {
    pub instance: InstanceRef,
    /// Target namespace stamped onto every rendered resource.
    pub namespace: String,
    pub release: Release,
    pub manifests: Vec<ManifestSource>,
    /// Rendered output, append-only across pipeline stages.
    pub resources: Vec<DynamicObject>,
}

impl ReconciliationRequest {
    pub fn new(instance: InstanceRef, namespace: impl Into<String>) -> Self {
        Self {
            instance,
            namespace: namespace.into(),
            release: Release::default(),
            manifests: Vec::new(),
            resources: Vec::new(),
        }
    }
}
