use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Characters Nix uses for store path digests (base-32 without `e`, `o`, `u`, `t`).
pub const NIX_BASE32_ALPHABET: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Length of a store path digest produced by Nix.
pub const HASH_LEN: usize = 32;

#[must_use]
pub fn is_hash_byte(byte: u8) -> bool {
    NIX_BASE32_ALPHABET.contains(&byte)
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorePathError {
    #[error("{path} is not under store root {root}")]
    NotUnderRoot { path: String, root: String },
    #[error("malformed store path basename '{basename}': {reason}")]
    Malformed {
        basename: String,
        reason: &'static str,
    },
}

/// Identity of a store object: `<hash>-<name>`, independent of any root.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorePath {
    hash: String,
    name: String,
}

impl StorePath {
    pub fn from_basename(basename: &str) -> Result<Self, StorePathError> {
        let malformed = |reason| StorePathError::Malformed {
            basename: basename.to_string(),
            reason,
        };
        let (hash, name) = basename
            .split_once('-')
            .ok_or_else(|| malformed("missing '-' between hash and name"))?;
        if hash.is_empty() || hash.len() > HASH_LEN {
            return Err(malformed("hash length out of range"));
        }
        if !hash.bytes().all(is_hash_byte) {
            return Err(malformed("hash contains characters outside the nix base-32 alphabet"));
        }
        if name.is_empty() {
            return Err(malformed("empty name"));
        }
        if name.contains('/') || name.contains('\0') {
            return Err(malformed("name contains a path separator or NUL"));
        }
        Ok(Self {
            hash: hash.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses an absolute store path such as `/nix/store/<hash>-<name>`.
    pub fn from_absolute(root: &str, path: &str) -> Result<Self, StorePathError> {
        let not_under = || StorePathError::NotUnderRoot {
            path: path.to_string(),
            root: root.to_string(),
        };
        let rest = path.strip_prefix(root).ok_or_else(not_under)?;
        let basename = rest.strip_prefix('/').ok_or_else(not_under)?;
        let basename = basename.trim_end_matches('/');
        if basename.contains('/') {
            return Err(StorePathError::Malformed {
                basename: basename.to_string(),
                reason: "points inside a store object rather than at one",
            });
        }
        Self::from_basename(basename)
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn basename(&self) -> String {
        format!("{}-{}", self.hash, self.name)
    }

    /// Location of this object under `root`.
    pub fn under(&self, root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join(self.basename())
    }

    /// Name with a trailing version component removed (`hello-2.12.1` -> `hello`).
    pub fn name_without_version(&self) -> &str {
        let bytes = self.name.as_bytes();
        for (idx, window) in bytes.windows(2).enumerate() {
            if window[0] == b'-' && window[1].is_ascii_digit() {
                return &self.name[..idx];
            }
        }
        &self.name
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.name)
    }
}
