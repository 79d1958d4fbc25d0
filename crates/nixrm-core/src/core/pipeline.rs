use serde::Serialize;
use tracing::{debug, info};

use super::cancel::Cancellation;
use super::config::Config;
use super::effects::Effects;
use super::errors::{PipelineError, RewriteError, Stage, TransferError};
use super::remote::{
    diff_manifest, launch, query_manifest, resolve_command, transfer_objects, with_backoff,
    LaunchRequest, RemoteLayout, RemoteShell, TransferOptions, TransferReport,
};
use super::rewrite::{rewrite_closure, RewriteCache, RewrittenObject};
use super::store::resolve_closure;
use super::tooling::progress::ProgressReporter;

/// One `nixrm run` invocation.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    pub installable: String,
    pub host: String,
    /// Program to run; defaults to the primary object's main program.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub build: bool,
    /// Stop after comparing with the remote manifest.
    pub dry_run: bool,
    pub tty: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub primary: String,
    pub host: String,
    pub remote_root: String,
    pub objects: usize,
    pub replacements: usize,
    pub present: usize,
    /// Objects the remote lacked when the run compared manifests.
    pub missing: Vec<String>,
    pub missing_bytes: u64,
    pub transfer: TransferReport,
    pub command: String,
    pub dry_run: bool,
    /// Exit status of the remote command; absent for dry runs.
    pub exit_code: Option<i32>,
}

fn checkpoint(cancel: &Cancellation, stage: Stage) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled(stage))
    } else {
        Ok(())
    }
}

/// Resolves, rewrites, publishes and runs `request.installable` on
/// `request.host`.
///
/// The mapping is validated before anything else runs, so an unusable mapping
/// never touches the store, the cache or the host.
pub fn run_remote(
    request: &RunRequest,
    config: &Config,
    effects: &dyn Effects,
    cancel: &Cancellation,
) -> Result<RunSummary, PipelineError> {
    let mapping = config.mapping().map_err(RewriteError::from)?;
    info!(
        installable = %request.installable,
        host = %request.host,
        from = mapping.original(),
        to = mapping.replacement(),
        "starting remote run"
    );

    let spinner = ProgressReporter::spinner(format!("resolving {}", request.installable));
    let closure = resolve_closure(
        effects.store(),
        &request.installable,
        request.build,
        &config.store_root,
    )?;
    spinner.finish(format!(
        "resolved {} objects ({} bytes)",
        closure.len(),
        closure.total_size()
    ));
    let command = match &request.command {
        Some(command) => command.clone(),
        None => resolve_command(effects.store(), &request.installable, &closure)?,
    };
    checkpoint(cancel, Stage::Rewrite)?;

    let cache = RewriteCache::open(&config.cache.path, &mapping)?;
    let rewritten = rewrite_closure(&closure, &mapping, &cache, config.jobs, cancel)?;
    checkpoint(cancel, Stage::Manifest)?;

    let shell = with_backoff(config.retries, config.retry_backoff, "connect", || {
        effects.connect(&request.host)
    })
    .map_err(PipelineError::manifest)?;
    if let Some(hook) = shell.forced_exit_hook() {
        cancel.on_forced_exit(hook);
    }
    let layout = RemoteLayout::new(mapping.replacement(), config.remote_tmp.as_deref());
    prepare(shell.as_ref(), &layout, config)?;
    let manifest = with_backoff(config.retries, config.retry_backoff, "manifest", || {
        query_manifest(shell.as_ref(), &layout)
    })
    .map_err(PipelineError::manifest)?;
    let diff = diff_manifest(&rewritten, &manifest).map_err(PipelineError::manifest)?;

    let mut summary = RunSummary {
        primary: closure.primary().store_path().basename(),
        host: request.host.clone(),
        remote_root: layout.root().to_string(),
        objects: rewritten.len(),
        replacements: rewritten.iter().map(RewrittenObject::replacements).sum(),
        present: diff.present.len(),
        missing: diff.missing.iter().map(|object| object.basename()).collect(),
        missing_bytes: diff.missing_bytes(),
        transfer: TransferReport::default(),
        command: command.clone(),
        dry_run: request.dry_run,
        exit_code: None,
    };
    if request.dry_run {
        info!(missing = summary.missing.len(), "dry run, not transferring");
        return Ok(summary);
    }
    checkpoint(cancel, Stage::Transfer)?;

    let options = TransferOptions {
        jobs: config.jobs,
        retries: config.retries,
        backoff: config.retry_backoff,
    };
    summary.transfer = transfer_objects(shell.as_ref(), &layout, &diff.missing, &options, cancel)?;
    checkpoint(cancel, Stage::Launch)?;

    let launch_request = LaunchRequest {
        closure: &closure,
        layout: &layout,
        command,
        args: request.args.clone(),
        library_path: config.library_path,
        tty: request.tty,
    };
    summary.exit_code = Some(launch(shell.as_ref(), &launch_request, cancel)?);
    Ok(summary)
}

fn prepare(
    shell: &dyn RemoteShell,
    layout: &RemoteLayout,
    config: &Config,
) -> Result<(), PipelineError> {
    with_backoff(config.retries, config.retry_backoff, "prepare", || {
        let output = shell
            .run(&layout.prepare_script())
            .map_err(|err| TransferError::Connect {
                host: shell.host().to_string(),
                reason: format!("{err:#}"),
            })?;
        if output.success() {
            Ok(())
        } else {
            Err(TransferError::ManifestQuery {
                host: shell.host().to_string(),
                status: output.code,
                stderr: output.stderr_summary(),
            })
        }
    })
    .map_err(PipelineError::manifest)?;
    debug!(root = layout.root(), staging = layout.staging(), "prepared remote layout");
    Ok(())
}
