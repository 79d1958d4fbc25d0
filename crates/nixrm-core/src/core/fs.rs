use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Staging directories older than this are leftovers of a killed run.
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Removes `path` even when the tree below it was made read-only.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };
    let removed = if meta.is_dir() {
        for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_dir() {
                let _ = set_mode(entry.path(), 0o700);
            }
        }
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.with_context(|| format!("failed to remove {}", path.display()))
}

/// Scratch directory inside the rewrite cache, removed on drop unless its
/// content was published.
pub(crate) struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Creates a fresh `<prefix>*` directory under `root`, pruning day-old
    /// leftovers with the same prefix first.
    pub(crate) fn new_in(root: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        prune_stale(root, prefix);
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(root)
            .with_context(|| format!("failed to create a staging dir under {}", root.display()))?
            .keep();
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Renames `child` of the staging dir onto `dest`.
    ///
    /// Returns `false` when `dest` already exists: another writer produced the
    /// same content-addressed tree first and the staged copy is dropped.
    pub(crate) fn publish(self, child: &Path, dest: &Path) -> Result<bool> {
        let source = self.path.join(child);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if dest.symlink_metadata().is_ok() {
            return Ok(false);
        }
        match fs::rename(&source, dest) {
            Ok(()) => Ok(true),
            Err(_) if dest.symlink_metadata().is_ok() => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!("failed to move {} to {}", source.display(), dest.display())
            }),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(err) = remove_tree(&self.path) {
            tracing::debug!(error = %format!("{err:#}"), "leaving staging dir behind");
        }
    }
}

fn prune_stale(root: &Path, prefix: &str) {
    let now = SystemTime::now();
    let stale = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= STALE_AFTER)
        });
    for entry in stale {
        let _ = remove_tree(entry.path());
    }
}

/// Writes `contents` to a sibling temp file, syncs it and renames it onto `dest`.
pub(crate) fn write_atomic(dest: &Path, contents: &[u8]) -> Result<()> {
    let parent = dest
        .parent()
        .with_context(|| format!("{} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create a temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("failed to write {}", dest.display()))?;
    tmp.persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to persist {}", dest.display()))?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpublished_staging_dirs_are_cleaned_up() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let leftover = {
            let staging = StagingDir::new_in(temp.path(), ".tmp-")?;
            fs::write(staging.path().join("file"), b"x")?;
            staging.path().to_path_buf()
        };
        assert!(!leftover.exists());
        Ok(())
    }

    #[test]
    fn first_publisher_wins() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dest = temp.path().join("trees/abcd-hello");

        let first = StagingDir::new_in(temp.path(), ".tmp-")?;
        fs::create_dir(first.path().join("abcd-hello"))?;
        fs::write(first.path().join("abcd-hello/file"), b"first")?;
        assert!(first.publish(Path::new("abcd-hello"), &dest)?);

        let second = StagingDir::new_in(temp.path(), ".tmp-")?;
        fs::create_dir(second.path().join("abcd-hello"))?;
        fs::write(second.path().join("abcd-hello/file"), b"second")?;
        assert!(!second.publish(Path::new("abcd-hello"), &dest)?);

        assert_eq!(fs::read(dest.join("file"))?, b"first");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn read_only_trees_can_be_removed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("sub"))?;
        fs::write(tree.join("sub/file"), b"x")?;
        set_mode(&tree.join("sub"), 0o555)?;
        set_mode(&tree, 0o555)?;
        remove_tree(&tree)?;
        assert!(!tree.exists());
        Ok(())
    }

    #[test]
    fn atomic_write_replaces_content() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dest = temp.path().join("records/a.json");
        write_atomic(&dest, b"one")?;
        write_atomic(&dest, b"two")?;
        assert_eq!(fs::read(&dest)?, b"two");
        Ok(())
    }
}
