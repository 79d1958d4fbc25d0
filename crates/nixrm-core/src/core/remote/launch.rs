use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use nixrm_domain::Closure;

use super::layout::RemoteLayout;
use super::shell::{shell_quote, RemoteShell};
use crate::core::cancel::Cancellation;
use crate::core::config::LibraryPathMode;
use crate::core::errors::{LaunchError, PipelineError, Stage};
use crate::core::process::{exit_code, flush_std_streams};
use crate::core::store::StoreQuery;
use crate::core::tooling::progress::SuspendGuard;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run on the remote host, against an already published closure.
#[derive(Clone, Debug)]
pub struct LaunchRequest<'a> {
    pub closure: &'a Closure,
    pub layout: &'a RemoteLayout,
    pub command: String,
    pub args: Vec<String>,
    pub library_path: LibraryPathMode,
    /// Request a remote terminal; set when local stdin is one.
    pub tty: bool,
}

impl LaunchRequest<'_> {
    fn bin_dir(&self) -> String {
        format!(
            "{}/bin",
            self.layout
                .object_path(&self.closure.primary().store_path().basename())
        )
    }

    fn library_dirs(&self) -> Vec<String> {
        let lib_of = |object: &nixrm_domain::StoreObject| {
            object
                .has_dir("lib")
                .then(|| format!("{}/lib", self.layout.object_path(&object.store_path().basename())))
        };
        match self.library_path {
            LibraryPathMode::None => Vec::new(),
            LibraryPathMode::Primary => lib_of(self.closure.primary()).into_iter().collect(),
            LibraryPathMode::Closure => {
                let primary = self.closure.primary();
                std::iter::once(primary)
                    .chain(
                        self.closure
                            .topological()
                            .filter(|object| object.store_path() != primary.store_path()),
                    )
                    .filter_map(lib_of)
                    .collect()
            }
        }
    }

    fn environment(&self) -> String {
        let mut script = format!("PATH={}:\"$PATH\"\nexport PATH\n", shell_quote(&self.bin_dir()));
        let libs = self.library_dirs();
        if !libs.is_empty() {
            script.push_str(&format!(
                "LD_LIBRARY_PATH={}${{LD_LIBRARY_PATH:+:$LD_LIBRARY_PATH}}\nexport LD_LIBRARY_PATH\n",
                shell_quote(&libs.join(":"))
            ));
        }
        script
    }

    fn preflight_script(&self) -> String {
        format!(
            "{}command -v {} >/dev/null 2>&1\n",
            self.environment(),
            shell_quote(&self.command)
        )
    }

    /// Records the shell's PID, which `exec` hands to the command.
    fn wrapper_script(&self, pid_path: &str) -> String {
        let mut exec = shell_quote(&self.command);
        for arg in &self.args {
            exec.push(' ');
            exec.push_str(&shell_quote(arg));
        }
        format!(
            "{env}mkdir -p {launch}\n\
             echo $$ > {pid}\n\
             exec {exec}\n",
            env = self.environment(),
            launch = shell_quote(&self.layout.launch_dir()),
            pid = shell_quote(pid_path),
        )
    }
}

/// Picks the program to run when none was given: the declared main program,
/// else the only entry of the primary's `bin`, else the primary's name without
/// its version when `bin` has it.
pub fn resolve_command(
    store: &dyn StoreQuery,
    installable: &str,
    closure: &Closure,
) -> Result<String, LaunchError> {
    if let Some(program) = store.main_program(installable) {
        debug!(program, "using declared main program");
        return Ok(program);
    }
    let primary = closure.primary();
    let bin = primary.entries_in("bin");
    if let [only] = bin.as_slice() {
        return Ok(only.clone());
    }
    let name = primary.store_path().name_without_version();
    if bin.iter().any(|entry| entry == name) {
        return Ok(name.to_string());
    }
    Err(LaunchError::NoCommand {
        object: primary.store_path().basename(),
    })
}

/// Runs the command with inherited stdio and returns its exit status.
///
/// Cancellation terminates the remote process through its recorded PID before
/// stopping the local client.
pub fn launch(
    shell: &dyn RemoteShell,
    request: &LaunchRequest<'_>,
    cancel: &Cancellation,
) -> Result<i32, PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled(Stage::Launch));
    }
    let host = shell.host().to_string();
    let dropped = |code: i32| shell.transport_failure_code() == Some(code);

    let preflight = shell
        .run(&request.preflight_script())
        .map_err(|err| LaunchError::Spawn(format!("{err:#}")))?;
    if !preflight.success() {
        if dropped(preflight.code) {
            return Err(LaunchError::SessionDropped { host }.into());
        }
        return Err(LaunchError::CommandNotFound {
            command: request.command.clone(),
            host,
        }
        .into());
    }

    let token = format!("{:016x}", rand::random::<u64>());
    let pid_path = request.layout.pid_path(&token);
    info!(
        host = %host,
        command = %request.command,
        args = request.args.len(),
        tty = request.tty,
        "launching remote command"
    );
    let _suspend = SuspendGuard::new();
    flush_std_streams();
    let mut child = shell
        .spawn_interactive(&request.wrapper_script(&pid_path), request.tty)
        .map_err(|err| LaunchError::Spawn(format!("{err:#}")))?;

    // Cancellation wins over an exit status collected in the same poll: the
    // client may have died from the same interrupt.
    let status = loop {
        if cancel.is_cancelled() {
            warn!(host = %host, "cancelling remote command");
            terminate_remote(shell, &pid_path);
            let _ = child.kill();
            let _ = child.wait();
            remove_pid_file(shell, &pid_path);
            return Err(PipelineError::Cancelled(Stage::Launch));
        }
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => break Err(err),
        }
    };
    let status = status.map_err(|err| LaunchError::Spawn(err.to_string()))?;
    let code = exit_code(status);
    if dropped(code) {
        return Err(LaunchError::SessionDropped { host }.into());
    }
    remove_pid_file(shell, &pid_path);
    debug!(code, "remote command finished");
    Ok(code)
}

fn terminate_remote(shell: &dyn RemoteShell, pid_path: &str) {
    let pid = shell_quote(pid_path);
    let script = format!("[ -f {pid} ] && kill -TERM \"$(cat {pid})\" 2>/dev/null || true\n");
    if let Err(err) = shell.run(&script) {
        warn!(%err, "failed to signal the remote command");
    }
}

fn remove_pid_file(shell: &dyn RemoteShell, pid_path: &str) {
    if let Err(err) = shell.run(&format!("rm -f {}\n", shell_quote(pid_path))) {
        debug!(%err, "failed to remove remote pid file");
    }
}
