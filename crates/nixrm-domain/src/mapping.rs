use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::store_path::StorePath;

pub const DEFAULT_STORE_ROOT: &str = "/nix/store";
pub const DEFAULT_REMAP_ROOT: &str = "/tmp/nixrm";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error(
        "replacement root '{replacement}' is {replacement_len} bytes but store root '{original}' \
         is {original_len} bytes; roots must have identical length"
    )]
    LengthMismatch {
        original: String,
        replacement: String,
        original_len: usize,
        replacement_len: usize,
    },
    #[error("root '{0}' must be an absolute path")]
    NotAbsolute(String),
    #[error("root '{0}' must not end with '/'")]
    TrailingSlash(String),
    #[error("root '{0}' contains a NUL byte")]
    ContainsNul(String),
    #[error("replacement root is identical to the store root '{0}'")]
    Identical(String),
}

/// Pair of store roots used for same-length substitution.
///
/// A value of this type always satisfies the equal-length invariant: every
/// constructor validates it, so rewriting code never re-checks lengths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RootMapping {
    original: String,
    replacement: String,
}

impl RootMapping {
    pub fn new(
        original: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Result<Self, MappingError> {
        let original = original.into();
        let replacement = replacement.into();
        for root in [&original, &replacement] {
            validate_root(root)?;
        }
        if original == replacement {
            return Err(MappingError::Identical(original));
        }
        if original.len() != replacement.len() {
            return Err(MappingError::LengthMismatch {
                original_len: original.len(),
                replacement_len: replacement.len(),
                original,
                replacement,
            });
        }
        Ok(Self {
            original,
            replacement,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// Mapping with the roots swapped.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            original: self.replacement.clone(),
            replacement: self.original.clone(),
        }
    }

    /// Where `path` lands after relocation under the replacement root.
    pub fn relocate(&self, path: &StorePath) -> PathBuf {
        path.under(&self.replacement)
    }

    /// Replaces a leading original root in `value` when it is followed by `/` or ends there.
    pub fn rewrite_prefix(&self, value: &[u8]) -> Option<Vec<u8>> {
        let root = self.original.as_bytes();
        if !value.starts_with(root) {
            return None;
        }
        match value.get(root.len()) {
            None | Some(b'/') => {
                let mut out = Vec::with_capacity(value.len());
                out.extend_from_slice(self.replacement.as_bytes());
                out.extend_from_slice(&value[root.len()..]);
                Some(out)
            }
            Some(_) => None,
        }
    }

    /// Path variant of [`RootMapping::rewrite_prefix`].
    pub fn rewrite_path(&self, path: &Path) -> Option<PathBuf> {
        let suffix = path.strip_prefix(&self.original).ok()?;
        if suffix.as_os_str().is_empty() {
            return Some(PathBuf::from(&self.replacement));
        }
        Some(Path::new(&self.replacement).join(suffix))
    }
}

fn validate_root(root: &str) -> Result<(), MappingError> {
    if !root.starts_with('/') {
        return Err(MappingError::NotAbsolute(root.to_string()));
    }
    if root.len() > 1 && root.ends_with('/') {
        return Err(MappingError::TrailingSlash(root.to_string()));
    }
    if root.len() == 1 {
        return Err(MappingError::NotAbsolute(root.to_string()));
    }
    if root.contains('\0') {
        return Err(MappingError::ContainsNul(root.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roots_form_a_valid_mapping() {
        let mapping = RootMapping::new(DEFAULT_STORE_ROOT, DEFAULT_REMAP_ROOT).unwrap();
        assert_eq!(mapping.len(), 10);
        assert_eq!(mapping.inverse().original(), "/tmp/nixrm");
    }

    #[test]
    fn rejects_shorter_replacement() {
        let err = RootMapping::new("/nix/store", "/tmp/nixr").unwrap_err();
        assert_eq!(
            err,
            MappingError::LengthMismatch {
                original: "/nix/store".into(),
                replacement: "/tmp/nixr".into(),
                original_len: 10,
                replacement_len: 9,
            }
        );
    }

    #[test]
    fn rejects_bad_roots() {
        assert!(matches!(
            RootMapping::new("nix/store/", "/tmp/nixrm"),
            Err(MappingError::NotAbsolute(_))
        ));
        assert!(matches!(
            RootMapping::new("/nix/store", "/tmp/nixr/"),
            Err(MappingError::TrailingSlash(_))
        ));
        assert!(matches!(
            RootMapping::new("/nix/store", "/nix/store"),
            Err(MappingError::Identical(_))
        ));
        assert!(matches!(
            RootMapping::new("/", "/"),
            Err(MappingError::NotAbsolute(_))
        ));
    }

    #[test]
    fn prefix_rewrite_requires_separator_or_end() {
        let mapping = RootMapping::new(DEFAULT_STORE_ROOT, DEFAULT_REMAP_ROOT).unwrap();
        assert_eq!(
            mapping.rewrite_prefix(b"/nix/store/abcd-libfoo/lib").as_deref(),
            Some(&b"/tmp/nixrm/abcd-libfoo/lib"[..])
        );
        assert_eq!(
            mapping.rewrite_prefix(b"/nix/store").as_deref(),
            Some(&b"/tmp/nixrm"[..])
        );
        assert_eq!(mapping.rewrite_prefix(b"/nix/stores/x"), None);
        assert_eq!(mapping.rewrite_prefix(b"/usr/lib"), None);
    }

    #[test]
    fn relocates_paths() {
        let mapping = RootMapping::new(DEFAULT_STORE_ROOT, DEFAULT_REMAP_ROOT).unwrap();
        assert_eq!(
            mapping.rewrite_path(Path::new("/nix/store/abcd-hello/bin/hello")),
            Some(PathBuf::from("/tmp/nixrm/abcd-hello/bin/hello"))
        );
        assert_eq!(mapping.rewrite_path(Path::new("../lib/libc.so")), None);
        let path = StorePath::from_basename("abcd-hello").unwrap();
        assert_eq!(
            mapping.relocate(&path),
            PathBuf::from("/tmp/nixrm/abcd-hello")
        );
    }
}
