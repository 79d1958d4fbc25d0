use std::fmt;

use nixrm_domain::{ClosureError, MappingError, StorePathError};

use crate::core::tooling::diagnostics;

/// Pipeline stage, used to tag failures and cancellations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Rewrite,
    Manifest,
    Transfer,
    Launch,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Rewrite => "rewrite",
            Self::Manifest => "manifest",
            Self::Transfer => "transfer",
            Self::Launch => "launch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("[NRM101] store query tool '{program}' is unavailable: {reason}")]
    Unavailable { program: String, reason: String },
    #[error("[NRM102] building {installable} failed: {stderr}")]
    BuildFailed { installable: String, stderr: String },
    #[error("[NRM103] `{command}` failed for {installable}: {stderr}")]
    QueryFailed {
        installable: String,
        command: String,
        stderr: String,
    },
    #[error("[NRM104] could not parse store query output: {0}")]
    MalformedOutput(String),
    #[error("[NRM105] {installable} resolved to {count} store paths; expected exactly one")]
    AmbiguousInstallable { installable: String, count: usize },
    #[error("[NRM106] {0}")]
    InvalidPath(#[from] StorePathError),
    #[error("[NRM107] {0}")]
    Graph(#[from] ClosureError),
    #[error("[NRM108] failed to list files of {object}: {reason}")]
    Listing { object: String, reason: String },
}

impl ResolutionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        use diagnostics::resolution as codes;
        match self {
            Self::Unavailable { .. } => codes::UNAVAILABLE,
            Self::BuildFailed { .. } => codes::BUILD_FAILED,
            Self::QueryFailed { .. } => codes::QUERY_FAILED,
            Self::MalformedOutput(_) => codes::MALFORMED_OUTPUT,
            Self::AmbiguousInstallable { .. } => codes::AMBIGUOUS_INSTALLABLE,
            Self::InvalidPath(_) => codes::INVALID_PATH,
            Self::Graph(_) => codes::GRAPH,
            Self::Listing { .. } => codes::LISTING,
        }
    }

    #[must_use]
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::Listing { object, .. } => Some(object),
            Self::Graph(ClosureError::DanglingReference { from, .. }) => Some(from),
            Self::Graph(ClosureError::Cycle(object) | ClosureError::Duplicate(object)) => {
                Some(object)
            }
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("[NRM201] {0}")]
    Mapping(#[from] MappingError),
    #[error(
        "[NRM202] {object}: {file} has a store reference at byte {offset} that cannot be \
         isolated in unrecognized binary content"
    )]
    AmbiguousReference {
        object: String,
        file: String,
        offset: usize,
    },
    #[error("[NRM203] {object}: {file} still references the store root at byte {offset} after rewriting")]
    ResidualReference {
        object: String,
        file: String,
        offset: usize,
    },
    #[error("[NRM204] {object}: failed to rewrite {file}: {reason}")]
    Io {
        object: String,
        file: String,
        reason: String,
    },
    #[error("[NRM205] rewrite cache failure: {0}")]
    Cache(String),
    #[error("[NRM206] cannot search for references under {root}: {reason}")]
    Scanner { root: String, reason: String },
}

impl RewriteError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        use diagnostics::rewrite as codes;
        match self {
            Self::Mapping(_) => codes::MAPPING,
            Self::AmbiguousReference { .. } => codes::AMBIGUOUS_REFERENCE,
            Self::ResidualReference { .. } => codes::RESIDUAL_REFERENCE,
            Self::Io { .. } => codes::IO,
            Self::Cache(_) => codes::CACHE,
            Self::Scanner { .. } => codes::SCANNER,
        }
    }

    #[must_use]
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::AmbiguousReference { object, .. }
            | Self::ResidualReference { object, .. }
            | Self::Io { object, .. } => Some(object),
            _ => None,
        }
    }

    #[must_use]
    pub fn file(&self) -> Option<&str> {
        match self {
            Self::AmbiguousReference { file, .. }
            | Self::ResidualReference { file, .. }
            | Self::Io { file, .. } => Some(file),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("[NRM301] cannot reach {host}: {reason}")]
    Connect { host: String, reason: String },
    #[error("[NRM302] manifest query on {host} failed (exit {status}): {stderr}")]
    ManifestQuery {
        host: String,
        status: i32,
        stderr: String,
    },
    #[error("[NRM303] unexpected manifest line from remote: '{0}'")]
    MalformedManifest(String),
    #[error(
        "[NRM304] {object} is published remotely with digest {remote_digest} ({remote_size} bytes) \
         but the local rewrite has digest {local_digest} ({local_size} bytes)"
    )]
    VerificationMismatch {
        object: String,
        local_digest: String,
        local_size: u64,
        remote_digest: String,
        remote_size: u64,
    },
    #[error("[NRM305] publishing {object} failed (exit {status}): {stderr}")]
    Publish {
        object: String,
        status: i32,
        stderr: String,
    },
    #[error("[NRM306] packing {object} failed: {reason}")]
    Archive { object: String, reason: String },
}

/// ssh diagnostics that another attempt cannot fix.
const PERMANENT_CONNECT_FAILURES: [&str; 4] = [
    "Permission denied",
    "Could not resolve hostname",
    "Host key verification failed",
    "REMOTE HOST IDENTIFICATION HAS CHANGED",
];

impl TransferError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        use diagnostics::transfer as codes;
        match self {
            Self::Connect { .. } => codes::CONNECT,
            Self::ManifestQuery { .. } => codes::MANIFEST_QUERY,
            Self::MalformedManifest(_) => codes::MALFORMED_MANIFEST,
            Self::VerificationMismatch { .. } => codes::VERIFICATION_MISMATCH,
            Self::Publish { .. } => codes::PUBLISH,
            Self::Archive { .. } => codes::ARCHIVE,
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// The ssh client reports its own failures (connection loss, refused
    /// multiplexing) with exit status 255; anything else came from the remote
    /// script and will fail the same way again. Connection failures that ssh
    /// attributes to credentials, name resolution or host keys are permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { reason, .. } => !PERMANENT_CONNECT_FAILURES
                .iter()
                .any(|needle| reason.contains(needle)),
            Self::ManifestQuery { status, .. } | Self::Publish { status, .. } => {
                *status == 255 || *status < 0
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::VerificationMismatch { object, .. }
            | Self::Publish { object, .. }
            | Self::Archive { object, .. } => Some(object),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(
        "[NRM401] cannot determine which program of {object} to run; pass one with -c <command>"
    )]
    NoCommand { object: String },
    #[error("[NRM402] command '{command}' was not found on {host}")]
    CommandNotFound { command: String, host: String },
    #[error("[NRM403] remote session to {host} dropped while running the command")]
    SessionDropped { host: String },
    #[error("[NRM404] failed to start the remote command: {0}")]
    Spawn(String),
}

impl LaunchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        use diagnostics::launch as codes;
        match self {
            Self::NoCommand { .. } => codes::NO_COMMAND,
            Self::CommandNotFound { .. } => codes::COMMAND_NOT_FOUND,
            Self::SessionDropped { .. } => codes::SESSION_DROPPED,
            Self::Spawn(_) => codes::SPAWN,
        }
    }
}

/// Failure of one invocation, tagged with the stage that produced it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error("{0}")]
    Transfer(#[source] TransferError, Stage),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("[NRM000] cancelled during {0}")]
    Cancelled(Stage),
}

impl PipelineError {
    pub(crate) fn manifest(err: TransferError) -> Self {
        Self::Transfer(err, Stage::Manifest)
    }

    pub(crate) fn transfer(err: TransferError) -> Self {
        Self::Transfer(err, Stage::Transfer)
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Resolution(_) => Stage::Resolve,
            Self::Rewrite(_) => Stage::Rewrite,
            Self::Transfer(_, stage) | Self::Cancelled(stage) => *stage,
            Self::Launch(_) => Stage::Launch,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolution(err) => err.code(),
            Self::Rewrite(err) => err.code(),
            Self::Transfer(err, _) => err.code(),
            Self::Launch(err) => err.code(),
            Self::Cancelled(_) => diagnostics::CANCELLED,
        }
    }

    /// Store object the failure is attributed to, when known.
    #[must_use]
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::Resolution(err) => err.object(),
            Self::Rewrite(err) => err.object(),
            Self::Transfer(err, _) => err.object(),
            Self::Launch(LaunchError::NoCommand { object }) => Some(object),
            _ => None,
        }
    }

    #[must_use]
    pub fn file(&self) -> Option<&str> {
        match self {
            Self::Rewrite(err) => err.file(),
            _ => None,
        }
    }

    /// Failures caused by the request itself rather than the environment.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Rewrite(RewriteError::Mapping(_))
                | Self::Resolution(
                    ResolutionError::QueryFailed { .. }
                        | ResolutionError::BuildFailed { .. }
                        | ResolutionError::AmbiguousInstallable { .. }
                )
                | Self::Launch(LaunchError::NoCommand { .. } | LaunchError::CommandNotFound { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_client_failures_are_transient() {
        let publish = |status| TransferError::Publish {
            object: "abcd-hello".into(),
            status,
            stderr: String::new(),
        };
        assert!(publish(255).is_transient());
        assert!(!publish(1).is_transient());
        let connect = |reason: &str| TransferError::Connect {
            host: "box".into(),
            reason: reason.into(),
        };
        assert!(connect("ssh: connect to host box port 22: Connection timed out").is_transient());
        assert!(connect("kex_exchange_identification: Connection closed").is_transient());
        assert!(!connect("user@box: Permission denied (publickey).").is_transient());
        assert!(!connect("ssh: Could not resolve hostname box: Name or service not known")
            .is_transient());
        assert!(!connect("Host key verification failed.").is_transient());
        assert!(!TransferError::MalformedManifest("x".into()).is_transient());
    }

    #[test]
    fn pipeline_errors_carry_stage_and_code() {
        let err = PipelineError::from(RewriteError::AmbiguousReference {
            object: "abcd-hello".into(),
            file: "lib/blob.bin".into(),
            offset: 12,
        });
        assert_eq!(err.stage(), Stage::Rewrite);
        assert_eq!(err.code(), "NRM202");
        assert_eq!(err.object(), Some("abcd-hello"));
        assert_eq!(err.file(), Some("lib/blob.bin"));
        assert!(err.to_string().starts_with("[NRM202] abcd-hello: lib/blob.bin"));

        let err = PipelineError::manifest(TransferError::MalformedManifest("?".into()));
        assert_eq!(err.stage(), Stage::Manifest);
        assert_eq!(err.code(), "NRM303");
        assert!(err.to_string().starts_with("[NRM303] unexpected manifest line"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(PipelineError::Cancelled(Stage::Transfer).code(), "NRM000");
    }

    #[test]
    fn mapping_errors_are_user_errors() {
        let mapping = nixrm_domain::RootMapping::new("/nix/store", "/tmp/nixr").unwrap_err();
        let err = PipelineError::from(RewriteError::from(mapping));
        assert!(err.is_user_error());
        assert_eq!(err.stage(), Stage::Rewrite);
    }
}
