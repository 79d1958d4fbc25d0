//! Copy-then-patch relocation of store objects to a new root.

mod cache;
mod elf;
mod format;
mod substitute;

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use nixrm_domain::{Closure, FileEntry, FileKind, RootMapping, StoreObject, StorePath};

pub use cache::RewriteCache;
pub use format::{ContentFormat, FormatKind};
pub use substitute::{rewrite_bytes, ReferenceIssue, ReferenceScanner};

use crate::core::cancel::Cancellation;
use crate::core::errors::{PipelineError, RewriteError, Stage};
use crate::core::fs::{set_mode, StagingDir};
use crate::core::tooling::progress::{worker_count, ProgressReporter};

/// Per-file entry of a rewrite report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRewrite {
    pub path: PathBuf,
    pub format: FormatKind,
    pub replacements: usize,
}

/// A store object relocated into a local tree under the replacement root's naming.
#[derive(Clone, Debug)]
pub struct RewrittenObject {
    pub store_path: StorePath,
    /// Local copy holding the patched contents.
    pub tree: PathBuf,
    /// Listing with symlink targets as written into `tree`.
    pub files: Vec<FileEntry>,
    /// SHA-256 over the canonical listing of the rewritten tree.
    pub digest: String,
    pub size: u64,
    pub report: Vec<FileRewrite>,
}

impl RewrittenObject {
    #[must_use]
    pub fn basename(&self) -> String {
        self.store_path.basename()
    }

    /// Total number of replaced references across all files.
    #[must_use]
    pub fn replacements(&self) -> usize {
        self.report.iter().map(|file| file.replacements).sum()
    }
}

/// Scanner for references to the original root of `mapping`.
///
/// # Errors
///
/// Fails when the root cannot be turned into a search pattern.
pub fn reference_scanner(mapping: &RootMapping) -> Result<ReferenceScanner, RewriteError> {
    ReferenceScanner::new(mapping.original()).map_err(|err| RewriteError::Scanner {
        root: mapping.original().to_string(),
        reason: err.to_string(),
    })
}

/// Rewrites one object into the cache, or returns the cached result.
///
/// `references` comes from [`reference_scanner`] for the same `mapping`.
pub fn rewrite_object(
    object: &StoreObject,
    mapping: &RootMapping,
    references: &ReferenceScanner,
    cache: &RewriteCache,
) -> Result<RewrittenObject, RewriteError> {
    let store_path = object.store_path();
    let tree = cache.tree_path(store_path);
    if let Some(record) = cache.load(store_path) {
        debug!(object = %store_path, "reusing cached rewrite");
        return Ok(RewrittenObject {
            store_path: record.store_path,
            tree,
            files: record.files,
            digest: record.digest,
            size: record.size,
            report: record.report,
        });
    }

    let basename = store_path.basename();
    let io_error = |file: &Path, reason: String| RewriteError::Io {
        object: basename.clone(),
        file: display_relative(file),
        reason,
    };
    let staging = StagingDir::new_in(cache.root(), ".tmp-")
        .map_err(|err| RewriteError::Cache(format!("{err:#}")))?;
    let staged = staging.path().join(&basename);

    let mut files = Vec::with_capacity(object.files().len());
    let mut report = Vec::new();
    let mut hasher = Sha256::new();
    for entry in object.files() {
        let source = entry.resolve(object.location());
        let target = entry.resolve(&staged);
        let mut content_digest = None;
        let kind = match &entry.kind {
            FileKind::Directory => {
                fs::create_dir(&target).map_err(|err| io_error(&entry.path, err.to_string()))?;
                FileKind::Directory
            }
            FileKind::Regular | FileKind::Executable => {
                let mut content =
                    fs::read(&source).map_err(|err| io_error(&entry.path, err.to_string()))?;
                let substitution =
                    rewrite_bytes(&mut content, mapping, references).map_err(|issue| match issue {
                        ReferenceIssue::Ambiguous { offset } => RewriteError::AmbiguousReference {
                            object: basename.clone(),
                            file: display_relative(&entry.path),
                            offset,
                        },
                        ReferenceIssue::Residual { offset } => RewriteError::ResidualReference {
                            object: basename.clone(),
                            file: display_relative(&entry.path),
                            offset,
                        },
                    })?;
                fs::write(&target, &content)
                    .map_err(|err| io_error(&entry.path, err.to_string()))?;
                let executable = entry.kind == FileKind::Executable;
                set_mode(&target, if executable { 0o755 } else { 0o644 })
                    .map_err(|err| io_error(&entry.path, format!("{err:#}")))?;
                content_digest = Some(hex::encode(Sha256::digest(&content)));
                if substitution.replacements > 0 {
                    debug!(
                        object = %store_path,
                        file = %entry.path.display(),
                        format = ?substitution.format,
                        replacements = substitution.replacements,
                        "patched"
                    );
                }
                report.push(FileRewrite {
                    path: entry.path.clone(),
                    format: substitution.format,
                    replacements: substitution.replacements,
                });
                entry.kind.clone()
            }
            FileKind::Symlink { target: link } => {
                let link = mapping.rewrite_path(link).unwrap_or_else(|| link.clone());
                make_symlink(&link, &target).map_err(|err| io_error(&entry.path, err))?;
                FileKind::Symlink { target: link }
            }
        };
        hash_entry(&mut hasher, &entry.path, &kind, content_digest.as_deref());
        files.push(FileEntry {
            path: entry.path.clone(),
            kind,
            size: entry.size,
        });
    }
    for entry in files.iter().filter(|entry| entry.kind == FileKind::Directory) {
        set_mode(&entry.resolve(&staged), 0o755)
            .map_err(|err| io_error(&entry.path, format!("{err:#}")))?;
    }

    let digest = hex::encode(hasher.finalize());
    let published = staging
        .publish(Path::new(&basename), &tree)
        .map_err(|err| RewriteError::Cache(format!("{err:#}")))?;
    if !published {
        debug!(object = %store_path, "rewritten tree already present");
    }
    let record = cache.save(store_path, digest, object.size(), files, report)?;
    Ok(RewrittenObject {
        store_path: record.store_path,
        tree,
        files: record.files,
        digest: record.digest,
        size: record.size,
        report: record.report,
    })
}

/// Rewrites every object of `closure` on a bounded pool, dependencies first.
pub fn rewrite_closure(
    closure: &Closure,
    mapping: &RootMapping,
    cache: &RewriteCache,
    jobs: Option<usize>,
    cancel: &Cancellation,
) -> Result<Vec<RewrittenObject>, PipelineError> {
    let references = reference_scanner(mapping)?;
    let objects: Vec<&StoreObject> = closure.topological().collect();
    let workers = worker_count(jobs, objects.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|err| RewriteError::Cache(format!("failed to start rewrite workers: {err}")))?;
    info!(
        objects = objects.len(),
        workers,
        from = mapping.original(),
        to = mapping.replacement(),
        "rewriting closure"
    );
    let progress = ProgressReporter::bar("rewriting", objects.len());
    let rewritten = pool.install(|| {
        objects
            .par_iter()
            .map(|object| {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled(Stage::Rewrite));
                }
                let rewritten = rewrite_object(object, mapping, &references, cache)?;
                progress.increment();
                Ok(rewritten)
            })
            .collect::<Result<Vec<_>, PipelineError>>()
    })?;
    let replacements: usize = rewritten.iter().map(RewrittenObject::replacements).sum();
    progress.finish(format!(
        "rewrote {} objects ({replacements} references)",
        rewritten.len()
    ));
    Ok(rewritten)
}

/// Feeds one canonical listing line: path, kind (which carries the executable
/// bit), then the content digest or link target.
fn hash_entry(hasher: &mut Sha256, path: &Path, kind: &FileKind, content: Option<&str>) {
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(kind.as_str().as_bytes());
    if let FileKind::Symlink { target } = kind {
        hasher.update([0]);
        hasher.update(target.to_string_lossy().as_bytes());
    }
    if let Some(content) = content {
        hasher.update([0]);
        hasher.update(content.as_bytes());
    }
    hasher.update([b'\n']);
}

fn display_relative(path: &Path) -> String {
    if path.as_os_str().is_empty() {
        ".".to_string()
    } else {
        path.display().to_string()
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<(), String> {
    std::os::unix::fs::symlink(target, link).map_err(|err| err.to_string())
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<(), String> {
    Err(format!(
        "cannot create symlink {} on this platform",
        link.display()
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::{BTreeMap, BTreeSet};
    use std::os::unix::fs::{symlink, PermissionsExt};

    use crate::core::store::list_object;

    struct Fixture {
        _temp: tempfile::TempDir,
        store: String,
        cache_dir: PathBuf,
        mapping: RootMapping,
    }

    impl Fixture {
        fn references(&self) -> Result<ReferenceScanner> {
            Ok(reference_scanner(&self.mapping)?)
        }
    }

    fn fixture() -> Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let store = temp.path().join("store");
        fs::create_dir_all(&store)?;
        let store = store.display().to_string();
        let remap = temp.path().join("remap").display().to_string();
        Ok(Fixture {
            cache_dir: temp.path().join("cache"),
            mapping: RootMapping::new(store.clone(), remap)?,
            store,
            _temp: temp,
        })
    }

    fn hello(fx: &Fixture) -> Result<StoreObject> {
        let root = Path::new(&fx.store).join("abcd-hello");
        fs::create_dir_all(root.join("bin"))?;
        fs::write(
            root.join("bin/hello"),
            format!(
                "#!{store}/wxyz-bash/bin/sh\nexec {store}/abcd-hello/libexec/hi\n",
                store = fx.store
            ),
        )?;
        fs::set_permissions(root.join("bin/hello"), fs::Permissions::from_mode(0o555))?;
        symlink(format!("{}/wxyz-bash/bin/sh", fx.store), root.join("bin/sh"))?;
        symlink("hello", root.join("bin/hi"))?;
        Ok(list_object(&fx.store, StorePath::from_basename("abcd-hello")?)?)
    }

    #[test]
    fn relocates_object_into_cache() -> Result<()> {
        let fx = fixture()?;
        let object = hello(&fx)?;
        let cache = RewriteCache::open(&fx.cache_dir, &fx.mapping)?;
        let rewritten = rewrite_object(&object, &fx.mapping, &fx.references()?, &cache)?;

        let remap = fx.mapping.replacement();
        let script = fs::read_to_string(rewritten.tree.join("bin/hello"))?;
        assert_eq!(
            script,
            format!("#!{remap}/wxyz-bash/bin/sh\nexec {remap}/abcd-hello/libexec/hi\n")
        );
        let mode = fs::metadata(rewritten.tree.join("bin/hello"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_link(rewritten.tree.join("bin/sh"))?,
            PathBuf::from(format!("{remap}/wxyz-bash/bin/sh"))
        );
        assert_eq!(fs::read_link(rewritten.tree.join("bin/hi"))?, PathBuf::from("hello"));
        assert_eq!(rewritten.size, object.size());
        assert_eq!(rewritten.replacements(), 2);
        assert_eq!(rewritten.digest.len(), 64);

        // source store untouched
        let original = fs::read_to_string(Path::new(&fx.store).join("abcd-hello/bin/hello"))?;
        assert!(original.contains(&fx.store));

        let again = rewrite_object(&object, &fx.mapping, &fx.references()?, &cache)?;
        assert_eq!(again.digest, rewritten.digest);
        assert_eq!(again.files, rewritten.files);
        Ok(())
    }

    #[test]
    fn inverse_mapping_restores_every_file() -> Result<()> {
        let fx = fixture()?;
        let root = Path::new(&fx.store).join("abcd-libfoo");
        fs::create_dir_all(root.join("lib"))?;
        fs::create_dir_all(root.join("bin"))?;
        let elf = elf::testing::elf64_with(
            &format!("{}/wxyz-glibc/lib/ld-linux-x86-64.so.2", fx.store),
            &format!("{}/abcd-libfoo/lib:$ORIGIN", fx.store),
        );
        fs::write(root.join("bin/foo"), &elf)?;
        fs::set_permissions(root.join("bin/foo"), fs::Permissions::from_mode(0o755))?;
        fs::write(
            root.join("lib/foo.pc"),
            format!("prefix={}/abcd-libfoo\n", fx.store),
        )?;
        symlink(format!("{}/wxyz-glibc/lib", fx.store), root.join("glibc"))?;
        symlink("lib", root.join("lib64"))?;
        let object = list_object(&fx.store, StorePath::from_basename("abcd-libfoo")?)?;

        let cache = RewriteCache::open(&fx.cache_dir, &fx.mapping)?;
        let forward = rewrite_object(&object, &fx.mapping, &fx.references()?, &cache)?;
        assert_eq!(forward.replacements(), 3);

        let inverse = fx.mapping.inverse();
        let relocated = list_object(
            &cache.root().display().to_string(),
            StorePath::from_basename("abcd-libfoo")?,
        )?;
        let back_cache = RewriteCache::open(&fx.cache_dir.join("back"), &inverse)?;
        let back = rewrite_object(
            &relocated,
            &inverse,
            &reference_scanner(&inverse)?,
            &back_cache,
        )?;

        for entry in object.files() {
            let original = entry.resolve(object.location());
            let restored = entry.resolve(&back.tree);
            match &entry.kind {
                FileKind::Regular | FileKind::Executable => {
                    assert_eq!(fs::read(&restored)?, fs::read(&original)?, "{entry:?}");
                }
                FileKind::Symlink { target } => {
                    assert_eq!(&fs::read_link(&restored)?, target, "{entry:?}");
                }
                FileKind::Directory => assert!(restored.is_dir()),
            }
        }
        Ok(())
    }

    #[test]
    fn ambiguous_binary_reference_fails_the_object() -> Result<()> {
        let fx = fixture()?;
        let root = Path::new(&fx.store).join("ijkl-blob");
        fs::create_dir_all(&root)?;
        let mut blob = vec![0u8, 1, 2];
        blob.extend_from_slice(fx.store.as_bytes());
        blob.extend_from_slice(b"/0c4bpmq2xpyy2bvvyx6d6wkhfmzbyjbf\0");
        fs::write(root.join("data.bin"), &blob)?;
        let object = list_object(&fx.store, StorePath::from_basename("ijkl-blob")?)?;
        let cache = RewriteCache::open(&fx.cache_dir, &fx.mapping)?;
        let err = rewrite_object(&object, &fx.mapping, &fx.references()?, &cache).unwrap_err();
        match err {
            RewriteError::AmbiguousReference {
                object,
                file,
                offset,
            } => {
                assert_eq!(object, "ijkl-blob");
                assert_eq!(file, "data.bin");
                assert_eq!(offset, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cache.tree_path(&StorePath::from_basename("ijkl-blob")?).exists());
        Ok(())
    }

    #[test]
    fn rewrites_whole_closure_in_dependency_order() -> Result<()> {
        let fx = fixture()?;
        let hello = hello(&fx)?;
        let bash_root = Path::new(&fx.store).join("wxyz-bash");
        fs::create_dir_all(bash_root.join("bin"))?;
        fs::write(bash_root.join("bin/sh"), b"\x7fELF")?;
        let bash = list_object(&fx.store, StorePath::from_basename("wxyz-bash")?)?;
        let mut refs = BTreeMap::new();
        refs.insert(
            hello.store_path().clone(),
            BTreeSet::from([bash.store_path().clone()]),
        );
        let primary = hello.store_path().clone();
        let closure = Closure::new(vec![hello, bash], &refs, &primary)?;
        let cache = RewriteCache::open(&fx.cache_dir, &fx.mapping)?;
        let cancel = Cancellation::new();
        let rewritten = rewrite_closure(&closure, &fx.mapping, &cache, Some(2), &cancel)?;
        let names: Vec<_> = rewritten.iter().map(RewrittenObject::basename).collect();
        assert_eq!(names, vec!["wxyz-bash".to_string(), "abcd-hello".to_string()]);

        cancel.cancel();
        let err = rewrite_closure(&closure, &fx.mapping, &cache, None, &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(Stage::Rewrite)));
        Ok(())
    }
}
