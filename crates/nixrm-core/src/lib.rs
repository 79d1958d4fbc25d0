#![deny(clippy::all)]

mod core;

pub use crate::core::cancel::Cancellation;
pub use crate::core::config::{
    Config, ConfigOverrides, EnvSnapshot, GlobalOptions, LibraryPathMode,
};
pub use crate::core::effects::{Effects, SystemEffects};
pub use crate::core::errors::{
    LaunchError, PipelineError, ResolutionError, RewriteError, Stage, TransferError,
};
pub use crate::core::pipeline::{run_remote, RunRequest, RunSummary};
pub use crate::core::process::RunOutput;
pub use crate::core::remote::{
    diff_manifest, launch, query_manifest, resolve_command, transfer_objects, LaunchRequest,
    LocalShell, ManifestDiff, ManifestEntry, RemoteLayout, RemoteShell, SshSession,
    TransferOptions, TransferReport,
};
pub use crate::core::rewrite::{
    reference_scanner, rewrite_bytes, rewrite_closure, rewrite_object, ContentFormat,
    FileRewrite, ReferenceScanner, RewriteCache, RewrittenObject,
};
pub use crate::core::store::{parse_path_info, resolve_closure, NixCli, PathInfo, StoreQuery};
pub use crate::core::tooling::outcome::{CommandStatus, ExecutionOutcome};
pub use crate::core::tooling::{outcome_from_run, progress::ProgressReporter};

pub use nixrm_domain::{
    Closure, FileEntry, FileKind, MappingError, RootMapping, StoreObject, StorePath,
    DEFAULT_REMAP_ROOT, DEFAULT_STORE_ROOT,
};
