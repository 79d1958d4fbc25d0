use std::collections::BTreeMap;

use tracing::{debug, info};

use super::layout::RemoteLayout;
use super::shell::RemoteShell;
use crate::core::errors::TransferError;
use crate::core::rewrite::RewrittenObject;

/// Published state of one object as recorded by its remote marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub basename: String,
    pub digest: String,
    pub size: u64,
}

/// Split of the rewritten closure against the remote manifest.
#[derive(Debug, Default)]
pub struct ManifestDiff<'a> {
    pub present: Vec<&'a RewrittenObject>,
    pub missing: Vec<&'a RewrittenObject>,
}

impl ManifestDiff<'_> {
    #[must_use]
    pub fn missing_bytes(&self) -> u64 {
        self.missing.iter().map(|object| object.size).sum()
    }
}

/// Runs the read-only listing script and parses its output.
///
/// A failed query is an error: treating it as an empty manifest would resend
/// everything and could clobber objects another invocation is using.
pub fn query_manifest(
    shell: &dyn RemoteShell,
    layout: &RemoteLayout,
) -> Result<BTreeMap<String, ManifestEntry>, TransferError> {
    let output = shell
        .run(&layout.manifest_script())
        .map_err(|err| TransferError::Connect {
            host: shell.host().to_string(),
            reason: format!("{err:#}"),
        })?;
    if !output.success() {
        return Err(TransferError::ManifestQuery {
            host: shell.host().to_string(),
            status: output.code,
            stderr: output.stderr_summary(),
        });
    }
    let entries = parse_manifest(&output.stdout)?;
    debug!(host = shell.host(), entries = entries.len(), "queried remote manifest");
    Ok(entries)
}

fn parse_manifest(stdout: &str) -> Result<BTreeMap<String, ManifestEntry>, TransferError> {
    let mut entries = BTreeMap::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let malformed = || TransferError::MalformedManifest(line.to_string());
        let mut fields = line.split_whitespace();
        let (Some(basename), Some(digest), Some(size), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };
        let size = size.parse::<u64>().map_err(|_| malformed())?;
        entries.insert(
            basename.to_string(),
            ManifestEntry {
                basename: basename.to_string(),
                digest: digest.to_string(),
                size,
            },
        );
    }
    Ok(entries)
}

/// Classifies each object as present or missing remotely.
///
/// A marker that disagrees with the local rewrite means the remote root holds
/// different content under the same store path, which is reported rather than
/// overwritten.
pub fn diff_manifest<'a>(
    objects: &'a [RewrittenObject],
    manifest: &BTreeMap<String, ManifestEntry>,
) -> Result<ManifestDiff<'a>, TransferError> {
    let mut diff = ManifestDiff::default();
    for object in objects {
        let basename = object.basename();
        match manifest.get(&basename) {
            Some(entry) if entry.digest == object.digest && entry.size == object.size => {
                diff.present.push(object);
            }
            Some(entry) => {
                return Err(TransferError::VerificationMismatch {
                    object: basename,
                    local_digest: object.digest.clone(),
                    local_size: object.size,
                    remote_digest: entry.digest.clone(),
                    remote_size: entry.size,
                });
            }
            None => diff.missing.push(object),
        }
    }
    info!(
        present = diff.present.len(),
        missing = diff.missing.len(),
        bytes = diff.missing_bytes(),
        "compared closure with remote manifest"
    );
    Ok(diff)
}
