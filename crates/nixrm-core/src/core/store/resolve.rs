use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use nixrm_domain::{Closure, FileEntry, FileKind, StoreObject, StorePath};

use super::query::StoreQuery;
use crate::core::errors::ResolutionError;

/// Resolves `installable` into its closure under `store_root`.
///
/// Builds first unless `build` is false, then asks the store for the primary
/// path and the recursive closure and lists every object's files.
pub fn resolve_closure(
    store: &dyn StoreQuery,
    installable: &str,
    build: bool,
    store_root: &str,
) -> Result<Closure, ResolutionError> {
    if build {
        info!(installable, "building");
        store.build(installable)?;
    }
    let primary = store.path_info(installable, false)?;
    let [primary] = primary.as_slice() else {
        return Err(ResolutionError::AmbiguousInstallable {
            installable: installable.to_string(),
            count: primary.len(),
        });
    };
    let primary = StorePath::from_absolute(store_root, &primary.path)?;

    let infos = store.path_info(installable, true)?;
    let mut references: BTreeMap<StorePath, BTreeSet<StorePath>> = BTreeMap::new();
    let mut objects = Vec::with_capacity(infos.len());
    for info in &infos {
        let path = StorePath::from_absolute(store_root, &info.path)?;
        let refs = info
            .references
            .iter()
            .map(|reference| StorePath::from_absolute(store_root, reference))
            .collect::<Result<BTreeSet<_>, _>>()?;
        objects.push(list_object(store_root, path.clone())?);
        references.insert(path, refs);
    }
    let closure = Closure::new(objects, &references, &primary)?;
    info!(
        objects = closure.len(),
        bytes = closure.total_size(),
        primary = %closure.primary().store_path(),
        "resolved closure"
    );
    Ok(closure)
}

/// Lists the files of one store object without following symlinks.
pub fn list_object(store_root: &str, path: StorePath) -> Result<StoreObject, ResolutionError> {
    let location = path.under(store_root);
    let listing_error = |reason: String| ResolutionError::Listing {
        object: path.basename(),
        reason,
    };
    let mut files = Vec::new();
    let walker = WalkDir::new(&location)
        .follow_links(false)
        .follow_root_links(false);
    for entry in walker {
        let entry = entry.map_err(|err| listing_error(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(&location)
            .map(Path::to_path_buf)
            .map_err(|err| listing_error(err.to_string()))?;
        let file_type = entry.file_type();
        let (kind, size) = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|err| listing_error(format!("{}: {err}", entry.path().display())))?;
            (FileKind::Symlink { target }, 0)
        } else if file_type.is_dir() {
            (FileKind::Directory, 0)
        } else {
            let meta = entry
                .metadata()
                .map_err(|err| listing_error(err.to_string()))?;
            let kind = if is_executable(&meta) {
                FileKind::Executable
            } else {
                FileKind::Regular
            };
            (kind, meta.len())
        };
        files.push(FileEntry {
            path: relative,
            kind,
            size,
        });
    }
    debug!(object = %path, files = files.len(), "listed store object");
    Ok(StoreObject::new(path, PathBuf::from(&location), files))
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}
