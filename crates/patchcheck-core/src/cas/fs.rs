use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{check_ref_name, CasError, CasStore, Digest, Result};

/// On-disk manifest store under the cache root.
///
/// ```text
/// <root>/blobs/sha256/<hex>      manifest bytes
/// <root>/refs/<kind>/<key hex>   hex digest of the current manifest blob
/// ```
///
/// Every file is written through a sibling temp file and a rename, so a
/// crash never leaves a half-written blob or ref behind.
pub struct FsCasStore {
    blobs: PathBuf,
    refs: PathBuf,
}

impl FsCasStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = Self {
            blobs: root.join("blobs").join("sha256"),
            refs: root.join("refs"),
        };
        fs::create_dir_all(&store.blobs)?;
        fs::create_dir_all(&store.refs)?;
        Ok(store)
    }

    fn blob(&self, digest: &Digest) -> PathBuf {
        self.blobs.join(digest.to_hex())
    }

    fn ref_file(&self, name: &str) -> Result<PathBuf> {
        check_ref_name(name)?;
        Ok(self.refs.join(name))
    }

    fn all_ref_targets(&self) -> Result<HashSet<Digest>> {
        let mut targets = HashSet::new();
        for kind in fs::read_dir(&self.refs)? {
            let kind = kind?;
            if kind.file_type()?.is_dir() {
                let name = kind.file_name().to_string_lossy().to_string();
                targets.extend(self.list_refs(&name)?.into_iter().map(|(_, d)| d));
            }
        }
        Ok(targets)
    }
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Err(CasError::InvalidRef(path.display().to_string()));
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CasError::Io(e.error))?;
    Ok(())
}

fn missing_is<T>(result: io::Result<T>, fallback: T) -> Result<T> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(fallback),
        other => Ok(other?),
    }
}

impl CasStore for FsCasStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.blob(&digest);
        if !path.is_file() {
            replace_file(&path, data)?;
        }
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let bytes = match fs::read(self.blob(digest)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(*digest))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = Digest::compute(&bytes);
        if actual != *digest {
            return Err(CasError::Corrupt {
                expected: *digest,
                actual,
            });
        }
        Ok(bytes)
    }

    fn write_ref(&self, name: &str, digest: &Digest) -> Result<()> {
        replace_file(&self.ref_file(name)?, digest.to_hex().as_bytes())
    }

    fn read_ref(&self, name: &str) -> Result<Option<Digest>> {
        let text = missing_is(fs::read_to_string(self.ref_file(name)?).map(Some), None)?;
        text.map(|t| t.trim().parse()).transpose()
    }

    fn delete_ref(&self, name: &str) -> Result<bool> {
        missing_is(fs::remove_file(self.ref_file(name)?).map(|_| true), false)
    }

    fn list_refs(&self, kind: &str) -> Result<Vec<(String, Digest)>> {
        let entries = match missing_is(fs::read_dir(self.ref_file(kind)?).map(Some), None)? {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let mut refs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file = entry.file_name().to_string_lossy().to_string();
            // dotfiles are in-flight temp files
            if file.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            let name = format!("{}/{}", kind, file);
            if let Some(digest) = self.read_ref(&name)? {
                refs.push((name, digest));
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn prune(&self) -> Result<usize> {
        let live = self.all_ref_targets()?;
        let mut removed = 0;
        for entry in fs::read_dir(&self.blobs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(digest) = name.parse::<Digest>() else {
                continue;
            };
            if !live.contains(&digest) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        debug!(removed, kept = live.len(), "pruned manifest blobs");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path().join("cas")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_is_idempotent_and_readable() {
        let (dir, store) = store();
        let first = store.put(b"{\"key\":1}").unwrap();
        let second = store.put(b"{\"key\":1}").unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get(&first).unwrap(), b"{\"key\":1}");
        let blobs = std::fs::read_dir(dir.path().join("cas/blobs/sha256")).unwrap();
        assert_eq!(blobs.count(), 1);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let absent = Digest::compute(b"never stored");
        assert!(matches!(store.get(&absent), Err(CasError::NotFound(d)) if d == absent));
    }

    #[test]
    fn tampered_blob_is_corrupt() {
        let (dir, store) = store();
        let digest = store.put(b"original").unwrap();
        std::fs::write(
            dir.path().join("cas/blobs/sha256").join(digest.to_hex()),
            b"tampered",
        )
        .unwrap();

        match store.get(&digest) {
            Err(CasError::Corrupt { expected, actual }) => {
                assert_eq!(expected, digest);
                assert_eq!(actual, Digest::compute(b"tampered"));
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn refs_can_be_moved_and_deleted() {
        let (_dir, store) = store();
        let old = store.put(b"old manifest").unwrap();
        let new = store.put(b"new manifest").unwrap();

        assert_eq!(store.read_ref("environment/k").unwrap(), None);
        store.write_ref("environment/k", &old).unwrap();
        store.write_ref("environment/k", &new).unwrap();
        assert_eq!(store.read_ref("environment/k").unwrap(), Some(new));

        assert!(store.delete_ref("environment/k").unwrap());
        assert!(!store.delete_ref("environment/k").unwrap());
    }

    #[test]
    fn list_refs_is_per_kind_and_sorted() {
        let (_dir, store) = store();
        let m = store.put(b"m").unwrap();
        store.write_ref("environment/bb", &m).unwrap();
        store.write_ref("environment/aa", &m).unwrap();
        store.write_ref("foundation/cc", &m).unwrap();

        let names: Vec<String> = store
            .list_refs("environment")
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["environment/aa", "environment/bb"]);
        assert!(store.list_refs("nothing-here").unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_only_referenced_blobs() {
        let (_dir, store) = store();
        let kept = store.put(b"referenced").unwrap();
        let orphan = store.put(b"orphaned").unwrap();
        store.write_ref("foundation/k", &kept).unwrap();

        assert_eq!(store.prune().unwrap(), 1);
        assert!(store.get(&kept).is_ok());
        assert!(matches!(store.get(&orphan), Err(CasError::NotFound(_))));
    }

    #[test]
    fn escaping_ref_names_are_rejected() {
        let (_dir, store) = store();
        let m = store.put(b"m").unwrap();
        assert!(matches!(
            store.write_ref("../../etc/passwd", &m),
            Err(CasError::InvalidRef(_))
        ));
    }
}
