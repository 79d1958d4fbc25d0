//! Configuration: environment snapshot, defaults, and CLI overrides.

pub mod settings;

pub use settings::*;
