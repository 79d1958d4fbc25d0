#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod closure;
pub mod mapping;
pub mod object;
pub mod store_path;

pub use closure::{Closure, ClosureError};
pub use mapping::{MappingError, RootMapping, DEFAULT_REMAP_ROOT, DEFAULT_STORE_ROOT};
pub use object::{FileEntry, FileKind, StoreObject};
pub use store_path::{is_hash_byte, StorePath, StorePathError, HASH_LEN, NIX_BASE32_ALPHABET};
