//! Internal implementation modules for `nixrm-core`.
//!
//! Callers should use the re-exports at the crate root rather than importing
//! these modules directly.

pub mod cancel;
pub mod config;
pub mod effects;
pub mod errors;
pub mod fs;
pub mod pipeline;
pub mod process;
pub mod remote;
pub mod rewrite;
pub mod store;
pub mod tooling;
