//! Remote side of a run: the object cache layout, its manifest, publishing
//! and launching, all driven through a [`RemoteShell`].

mod archive;
pub mod launch;
pub mod layout;
pub mod manifest;
mod retry;
pub mod shell;
pub mod transfer;

pub use launch::{launch, resolve_command, LaunchRequest};
pub use layout::RemoteLayout;
pub use manifest::{diff_manifest, query_manifest, ManifestDiff, ManifestEntry};
pub(crate) use retry::with_backoff;
pub use shell::{LocalShell, RemoteShell, SshSession};
pub use transfer::{transfer_objects, TransferOptions, TransferReport};
