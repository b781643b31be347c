//! Dependency manifest fingerprinting
//!
//! Walks a checked-out source tree and hashes every file that declares
//! dependencies (requirements files, lockfiles, build manifests). The
//! result is recorded on environment artifacts so that two artifacts built
//! from different dependency declarations can be told apart.

use crate::error::FingerprintError;
use crate::recipe::normalize_text;
use crate::{Fingerprint, FingerprintSource, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exact file names treated as dependency manifests.
const MANIFEST_NAMES: &[&str] = &[
    "setup.py",
    "setup.cfg",
    "pyproject.toml",
    "Pipfile",
    "Pipfile.lock",
    "poetry.lock",
    "environment.yml",
    "tox.ini",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    "go.mod",
    "go.sum",
    "Gemfile",
    "Gemfile.lock",
    "flake.lock",
];

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "__pycache__",
    "venv",
    "build",
    "dist",
];

/// Manifest fingerprint plus the files that went into it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFingerprint {
    /// Combined fingerprint
    pub fingerprint: Fingerprint,
    /// Relative paths of hashed manifests, sorted
    pub files: Vec<String>,
}

/// Returns true when `name` is a recognized dependency manifest
///
/// Matches the fixed names in [`MANIFEST_NAMES`] plus any
/// `requirements*.txt` / `requirements*.in` file.
pub fn is_manifest_file(name: &str) -> bool {
    if MANIFEST_NAMES.contains(&name) {
        return true;
    }
    name.starts_with("requirements") && (name.ends_with(".txt") || name.ends_with(".in"))
}

/// Fingerprint the dependency manifests of a source tree
///
/// Files are hashed as `relative_path \0 normalized_content \0` in sorted
/// path order, so the result is independent of directory iteration order
/// and of line-ending differences.
pub fn fingerprint_manifests(tree: &Path) -> Result<ManifestFingerprint> {
    if !tree.is_dir() {
        return Err(FingerprintError::TreeNotFound(
            tree.to_string_lossy().to_string(),
        ));
    }

    info!("Fingerprinting dependency manifests in {:?}", tree);

    let mut found = Vec::new();
    collect_manifests(tree, &mut found)?;
    found.sort();

    let mut hasher = Sha256::new();
    let mut files = Vec::with_capacity(found.len());

    for path in &found {
        let relative = path
            .strip_prefix(tree)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        hasher.update(relative.as_bytes());
        hasher.update(b"\0");

        let content = std::fs::read(path)?;
        hasher.update(normalize_text(&content));
        hasher.update(b"\0");

        files.push(relative);
    }

    let hash = hex::encode(hasher.finalize());
    let source = if files.is_empty() {
        FingerprintSource::Empty
    } else {
        FingerprintSource::Manifests
    };

    debug!(
        "Manifest fingerprint: {} ({} files)",
        &hash[..12],
        files.len()
    );
    Ok(ManifestFingerprint {
        fingerprint: Fingerprint::new(hash, source),
        files,
    })
}

fn collect_manifests(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        // Skip hidden entries (.git, .venv, .tox) and build output
        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect_manifests(&path, files)?;
        } else if file_type.is_file() && is_manifest_file(&name) {
            files.push(path);
        }
    }

    Ok(())
}
