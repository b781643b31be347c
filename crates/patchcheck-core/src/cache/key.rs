use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cas::Digest;
use crate::domain::RepositoryRef;
use crate::layer::recipe::FoundationSpec;

/// Which layer an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Foundation,
    Environment,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Foundation => "foundation",
            LayerKind::Environment => "environment",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cacheable layer.
///
/// The digest is taken over the JSON encoding of this enum, whose field
/// order is fixed by the declaration, so equal keys always hash equally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum BuildKey {
    Foundation {
        os: String,
        runtime: String,
        /// Sorted and deduplicated.
        tooling: Vec<String>,
    },
    Environment {
        location: String,
        revision: String,
        dependency_fingerprint: String,
    },
}

impl BuildKey {
    pub fn foundation(spec: &FoundationSpec) -> Self {
        let mut tooling = spec.tooling.clone();
        tooling.sort();
        tooling.dedup();
        BuildKey::Foundation {
            os: spec.os.clone(),
            runtime: spec.runtime.clone(),
            tooling,
        }
    }

    pub fn environment(repo: &RepositoryRef, dependency_fingerprint: impl Into<String>) -> Self {
        BuildKey::Environment {
            location: repo.location.clone(),
            revision: repo.revision.clone(),
            dependency_fingerprint: dependency_fingerprint.into(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            BuildKey::Foundation { .. } => LayerKind::Foundation,
            BuildKey::Environment { .. } => LayerKind::Environment,
        }
    }

    /// SHA-256 of the canonical encoding.
    pub fn digest(&self) -> Digest {
        // Serializing a derived enum of strings cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Digest::compute(&bytes)
    }

    /// Name of the persisted ref for this key.
    pub fn ref_name(&self) -> String {
        format!("{}/{}", self.kind(), self.digest().to_hex())
    }

    /// Short human-readable label for logs.
    pub fn label(&self) -> String {
        match self {
            BuildKey::Foundation { os, runtime, .. } => format!("foundation:{}/{}", os, runtime),
            BuildKey::Environment {
                location,
                revision,
                dependency_fingerprint,
            } => format!(
                "environment:{}@{}#{}",
                location,
                short(revision),
                short(dependency_fingerprint)
            ),
        }
    }
}

fn short(s: &str) -> &str {
    &s[..s.len().min(12)]
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Backend-specific handle to a built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Where the backend keeps the image (path, registry ref, in-memory id).
    pub location: String,
    /// Free-form build metadata (tool versions, manifest fingerprint).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ImageRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Immutable built execution image, owned by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: BuildKey,
    /// SHA-256 over the key and image reference.
    pub content_hash: Digest,
    pub image: ImageRef,
    pub built_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    key: &'a BuildKey,
    image: &'a ImageRef,
}

impl Artifact {
    pub fn new(key: BuildKey, image: ImageRef) -> Self {
        let content_hash = Self::compute_hash(&key, &image);
        Self {
            key,
            content_hash,
            image,
            built_at: Utc::now(),
        }
    }

    fn compute_hash(key: &BuildKey, image: &ImageRef) -> Digest {
        let bytes = serde_json::to_vec(&HashedFields { key, image }).unwrap_or_default();
        Digest::compute(&bytes)
    }

    /// True when the stored hash matches the key and image.
    pub fn verify(&self) -> bool {
        Self::compute_hash(&self.key, &self.image) == self.content_hash
    }

    pub fn kind(&self) -> LayerKind {
        self.key.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(tooling: &[&str]) -> FoundationSpec {
        FoundationSpec {
            os: "linux".into(),
            runtime: "python3".into(),
            tooling: tooling.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn foundation_key_ignores_tooling_order() {
        let a = BuildKey::foundation(&spec(&["git", "make"]));
        let b = BuildKey::foundation(&spec(&["make", "git", "git"]));
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn environment_key_depends_on_all_fields() {
        let repo = RepositoryRef::new("https://example.com/r.git", "abc");
        let a = BuildKey::environment(&repo, "fp1");
        let b = BuildKey::environment(&repo, "fp2");
        let c = BuildKey::environment(&RepositoryRef::new("https://example.com/r.git", "def"), "fp1");
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.kind(), LayerKind::Environment);
    }

    #[test]
    fn ref_name_is_layer_scoped() {
        let key = BuildKey::foundation(&spec(&["git"]));
        let name = key.ref_name();
        assert!(name.starts_with("foundation/"));
        assert_eq!(name.len(), "foundation/".len() + 64);
    }

    #[test]
    fn artifact_hash_verifies_and_detects_tamper() {
        let key = BuildKey::foundation(&spec(&["git"]));
        let mut artifact = Artifact::new(key, ImageRef::new("/layers/f").with_metadata("git", "2.43"));
        assert!(artifact.verify());
        artifact.image.location = "/elsewhere".into();
        assert!(!artifact.verify());
    }

    #[test]
    fn artifact_hash_ignores_build_time() {
        let key = BuildKey::foundation(&spec(&["git"]));
        let a = Artifact::new(key.clone(), ImageRef::new("/l"));
        let b = Artifact::new(key, ImageRef::new("/l"));
        assert_eq!(a.content_hash, b.content_hash);
    }
}
