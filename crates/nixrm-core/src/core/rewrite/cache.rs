use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use nixrm_domain::{FileEntry, RootMapping, StorePath};

use super::FileRewrite;
use crate::core::errors::RewriteError;
use crate::core::fs::write_atomic;

const RECORD_VERSION: u32 = 1;

/// Persisted description of one rewritten tree; its presence marks the tree
/// as complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RewriteRecord {
    pub(crate) version: u32,
    pub(crate) store_path: StorePath,
    pub(crate) digest: String,
    pub(crate) size: u64,
    pub(crate) files: Vec<FileEntry>,
    pub(crate) report: Vec<FileRewrite>,
}

/// Local cache of rewritten trees for one root mapping:
/// `<base>/rewritten/<mapping key>/<basename>` plus `<basename>.json`.
#[derive(Debug, Clone)]
pub struct RewriteCache {
    root: PathBuf,
}

impl RewriteCache {
    pub fn open(base: &Path, mapping: &RootMapping) -> Result<Self, RewriteError> {
        let root = base.join("rewritten").join(mapping_key(mapping));
        fs::create_dir_all(&root).map_err(|err| {
            RewriteError::Cache(format!("failed to create {}: {err}", root.display()))
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn tree_path(&self, path: &StorePath) -> PathBuf {
        self.root.join(path.basename())
    }

    fn record_path(&self, path: &StorePath) -> PathBuf {
        self.root.join(format!("{}.json", path.basename()))
    }

    /// Record of a previously completed rewrite, if one is usable.
    pub(crate) fn load(&self, path: &StorePath) -> Option<RewriteRecord> {
        let record_path = self.record_path(path);
        let raw = fs::read(&record_path).ok()?;
        let record: RewriteRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(record = %record_path.display(), %err, "ignoring unreadable rewrite record");
                return None;
            }
        };
        if record.version != RECORD_VERSION || &record.store_path != path {
            debug!(object = %path, "rewrite record is stale");
            return None;
        }
        if fs::symlink_metadata(self.tree_path(path)).is_err() {
            debug!(object = %path, "rewrite record without tree");
            return None;
        }
        Some(record)
    }

    pub(crate) fn save(
        &self,
        path: &StorePath,
        digest: String,
        size: u64,
        files: Vec<FileEntry>,
        report: Vec<FileRewrite>,
    ) -> Result<RewriteRecord, RewriteError> {
        let record = RewriteRecord {
            version: RECORD_VERSION,
            store_path: path.clone(),
            digest,
            size,
            files,
            report,
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|err| RewriteError::Cache(format!("failed to encode record: {err}")))?;
        write_atomic(&self.record_path(path), &json)
            .map_err(|err| RewriteError::Cache(format!("{err:#}")))?;
        Ok(record)
    }
}

fn mapping_key(mapping: &RootMapping) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mapping.original().as_bytes());
    hasher.update([0]);
    hasher.update(mapping.replacement().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn cache_roots_are_keyed_by_mapping() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let a = RewriteCache::open(temp.path(), &RootMapping::new("/nix/store", "/tmp/nixrm")?)?;
        let b = RewriteCache::open(temp.path(), &RootMapping::new("/nix/store", "/opt/nixrm")?)?;
        assert_ne!(a.root(), b.root());
        assert!(a.root().starts_with(temp.path().join("rewritten")));
        Ok(())
    }

    #[test]
    fn records_require_their_tree() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = RewriteCache::open(temp.path(), &RootMapping::new("/nix/store", "/tmp/nixrm")?)?;
        let path = StorePath::from_basename("abcd-hello")?;
        cache.save(&path, "d".repeat(64), 3, Vec::new(), Vec::new())?;
        assert!(cache.load(&path).is_none());
        fs::create_dir(cache.tree_path(&path))?;
        let record = cache.load(&path).expect("record usable");
        assert_eq!(record.size, 3);

        fs::write(cache.record_path(&path), b"{not json")?;
        assert!(cache.load(&path).is_none());
        Ok(())
    }
}
