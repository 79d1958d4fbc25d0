use std::io::{Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use super::archive::pack_object;
use super::layout::RemoteLayout;
use super::retry::with_backoff;
use super::shell::RemoteShell;
use crate::core::cancel::Cancellation;
use crate::core::errors::{PipelineError, Stage, TransferError};
use crate::core::rewrite::RewrittenObject;
use crate::core::tooling::progress::{worker_count, ProgressReporter};

#[derive(Clone, Debug)]
pub struct TransferOptions {
    pub jobs: Option<usize>,
    /// Attempts per object, including the first.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            jobs: None,
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Objects this invocation published.
    pub sent: usize,
    /// Objects found already published, including ones a concurrent writer won.
    pub skipped: usize,
    /// Compressed bytes streamed for published objects.
    pub bytes: u64,
}

enum Published {
    Sent(u64),
    Present,
}

/// Publishes `objects` to the remote root on a bounded pool.
///
/// Each object is packed, streamed into its own staging directory and renamed
/// into place; its marker is written only after the rename, so an interrupted
/// run leaves nothing the manifest would count as present.
pub fn transfer_objects(
    shell: &dyn RemoteShell,
    layout: &RemoteLayout,
    objects: &[&RewrittenObject],
    options: &TransferOptions,
    cancel: &Cancellation,
) -> Result<TransferReport, PipelineError> {
    if objects.is_empty() {
        return Ok(TransferReport::default());
    }
    let workers = worker_count(options.jobs, objects.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|err| {
            PipelineError::transfer(TransferError::Connect {
                host: shell.host().to_string(),
                reason: format!("failed to start transfer workers: {err}"),
            })
        })?;
    info!(
        host = shell.host(),
        objects = objects.len(),
        workers,
        "transferring objects"
    );
    let sent = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let bytes = AtomicU64::new(0);
    let progress = ProgressReporter::bar("transferring", objects.len());
    pool.install(|| {
        objects.par_iter().try_for_each(|object| {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(Stage::Transfer));
            }
            match publish_one(shell, layout, object, options)? {
                Published::Sent(size) => {
                    sent.fetch_add(1, Ordering::Relaxed);
                    bytes.fetch_add(size, Ordering::Relaxed);
                }
                Published::Present => {
                    skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
            progress.increment();
            Ok(())
        })
    })?;
    let report = TransferReport {
        sent: sent.into_inner(),
        skipped: skipped.into_inner(),
        bytes: bytes.into_inner(),
    };
    progress.finish(format!(
        "sent {} objects ({} bytes), {} already present",
        report.sent, report.bytes, report.skipped
    ));
    Ok(report)
}

fn publish_one(
    shell: &dyn RemoteShell,
    layout: &RemoteLayout,
    object: &RewrittenObject,
    options: &TransferOptions,
) -> Result<Published, PipelineError> {
    let basename = object.basename();
    let (mut archive, archive_size) = pack_object(object).map_err(|err| {
        PipelineError::transfer(TransferError::Archive {
            object: basename.clone(),
            reason: format!("{err:#}"),
        })
    })?;
    let token = format!("{:016x}", rand::random::<u64>());
    let script = layout.publish_script(&basename, &object.digest, object.size, &token);
    debug!(object = %basename, archive_size, "publishing object");

    let outcome = with_backoff(options.retries, options.backoff, &basename, || {
        archive
            .seek(SeekFrom::Start(0))
            .map_err(|err| TransferError::Archive {
                object: basename.clone(),
                reason: err.to_string(),
            })?;
        let output = shell
            .run_with_input(&script, &mut archive)
            .map_err(|err| TransferError::Connect {
                host: shell.host().to_string(),
                reason: format!("{err:#}"),
            })?;
        if !output.success() {
            return Err(TransferError::Publish {
                object: basename.clone(),
                status: output.code,
                stderr: output.stderr_summary(),
            });
        }
        let reply = output.stdout.trim();
        if let Some(remote) = reply.strip_prefix("mismatch") {
            let mut fields = remote.split_whitespace();
            return Err(TransferError::VerificationMismatch {
                object: basename.clone(),
                local_digest: object.digest.clone(),
                local_size: object.size,
                remote_digest: fields.next().unwrap_or("<unreadable>").to_string(),
                remote_size: fields.next().and_then(|size| size.parse().ok()).unwrap_or(0),
            });
        }
        match reply {
            "present" => Ok(Published::Present),
            "published" => Ok(Published::Sent(archive_size)),
            other => Err(TransferError::Publish {
                object: basename.clone(),
                status: output.code,
                stderr: format!("unexpected publish output: {other}"),
            }),
        }
    })
    .map_err(PipelineError::transfer)?;
    if matches!(outcome, Published::Present) {
        debug!(object = %basename, "object already published");
    }
    Ok(outcome)
}
