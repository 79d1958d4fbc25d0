use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store_path::StorePath;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FileKind {
    Regular,
    Executable,
    Symlink { target: PathBuf },
    Directory,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Executable => "executable",
            Self::Symlink { .. } => "symlink",
            Self::Directory => "directory",
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::Regular | Self::Executable)
    }
}

/// One entry of a store object's listing. `path` is relative to the object
/// root; the empty path denotes the object itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    #[serde(flatten)]
    pub kind: FileKind,
    pub size: u64,
}

impl FileEntry {
    pub fn resolve(&self, base: &Path) -> PathBuf {
        if self.path.as_os_str().is_empty() {
            base.to_path_buf()
        } else {
            base.join(&self.path)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreObject {
    path: StorePath,
    location: PathBuf,
    files: Vec<FileEntry>,
    size: u64,
}

impl StoreObject {
    /// `files` are sorted by path so listings compare and hash deterministically.
    pub fn new(path: StorePath, location: PathBuf, mut files: Vec<FileEntry>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let size = files
            .iter()
            .filter(|entry| entry.kind.is_file())
            .map(|entry| entry.size)
            .sum();
        Self {
            path,
            location,
            files,
            size,
        }
    }

    pub fn store_path(&self) -> &StorePath {
        &self.path
    }

    /// Absolute location under the original root.
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the object has a top-level directory named `dir` (such as `bin`),
    /// either real or a symlink such as `lib -> lib64`.
    pub fn has_dir(&self, dir: &str) -> bool {
        self.files.iter().any(|entry| {
            entry.path == Path::new(dir)
                && matches!(entry.kind, FileKind::Directory | FileKind::Symlink { .. })
        })
    }

    /// Names of the direct children of `dir` in the listing.
    pub fn entries_in(&self, dir: &str) -> Vec<String> {
        let dir = Path::new(dir);
        self.files
            .iter()
            .filter(|entry| entry.path.parent() == Some(dir))
            .filter_map(|entry| entry.path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect()
    }
}
