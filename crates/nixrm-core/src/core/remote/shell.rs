use std::env;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

use anyhow::{anyhow, Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::core::cancel::ExitHook;
use crate::core::errors::TransferError;
use crate::core::process::{exit_code, run_command, run_command_with_input, spawn_passthrough, RunOutput};

/// Client used for the interactive launch; `openssh` runs the same binary.
const SSH_PROGRAM: &str = "ssh";
/// Exit status the ssh client uses for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;
const STREAM_CHUNK: usize = 64 * 1024;

/// Executes shell scripts on the target host.
///
/// Every stage talks to the host through this seam: scripts are POSIX `sh`
/// and receive no arguments.
pub trait RemoteShell: Send + Sync {
    fn host(&self) -> &str;

    /// Runs `script` with stdin closed, capturing its output.
    fn run(&self, script: &str) -> Result<RunOutput>;

    /// Runs `script` with `input` streamed to its stdin, capturing its output.
    fn run_with_input(&self, script: &str, input: &mut dyn Read) -> Result<RunOutput>;

    /// Starts `script` with inherited stdio; `tty` requests a remote terminal.
    ///
    /// Without a terminal the client gets its own process group, so terminal
    /// interrupts reach nixrm only.
    fn spawn_interactive(&self, script: &str, tty: bool) -> Result<Child>;

    /// Exit status reserved for transport failures, when the transport has one.
    fn transport_failure_code(&self) -> Option<i32>;

    /// Teardown to run when the process is forced to exit without unwinding.
    fn forced_exit_hook(&self) -> Option<ExitHook> {
        None
    }
}

/// Single-quotes `value` for POSIX `sh`.
pub(crate) fn shell_quote(value: &str) -> String {
    let mut escaped = String::from("'");
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// One multiplexed ssh connection, closed on drop.
///
/// Commands run on the `openssh` session from a private runtime, so the
/// synchronous pipeline and its worker threads can share it.
pub struct SshSession {
    host: String,
    session: Option<Session>,
    runtime: Runtime,
}

impl SshSession {
    /// Opens the master connection with strict host-key checking.
    pub fn connect(host: &str) -> Result<Self, TransferError> {
        let connect_error = |reason: String| TransferError::Connect {
            host: host.to_string(),
            reason,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("nixrm-ssh")
            .enable_all()
            .build()
            .map_err(|err| connect_error(format!("failed to start the ssh runtime: {err}")))?;
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Strict)
            .control_directory(env::temp_dir());
        debug!(host, "opening ssh master connection");
        let session = runtime
            .block_on(builder.connect(host))
            .map_err(|err| connect_error(format!("{:#}", anyhow::Error::new(err))))?;
        Ok(Self {
            host: host.to_string(),
            session: Some(session),
            runtime,
        })
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("ssh session to {} is closed", self.host))
    }
}

impl RemoteShell for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn run(&self, script: &str) -> Result<RunOutput> {
        let session = self.session()?;
        let output = self
            .runtime
            .block_on(session.command("sh").arg("-c").arg(script).output());
        settle(output)
    }

    fn run_with_input(&self, script: &str, input: &mut dyn Read) -> Result<RunOutput> {
        let session = self.session()?;
        self.runtime.block_on(async {
            let spawned = session
                .command("sh")
                .arg("-c")
                .arg(script)
                .stdin(openssh::Stdio::piped())
                .stdout(openssh::Stdio::piped())
                .stderr(openssh::Stdio::piped())
                .spawn()
                .await;
            let mut child = match spawned {
                Ok(child) => child,
                Err(err) => return settle(Err(err)),
            };
            let mut stdin = child
                .stdin()
                .take()
                .ok_or_else(|| anyhow!("remote command has no stdin pipe"))?;
            let feed = async move {
                let mut chunk = vec![0u8; STREAM_CHUNK];
                loop {
                    let read = input.read(&mut chunk)?;
                    if read == 0 {
                        break;
                    }
                    stdin.write_all(&chunk[..read]).await?;
                }
                stdin.shutdown().await
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            if let Err(err) = fed {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    return Err(err).context("streaming input to the remote command");
                }
            }
            settle(output)
        })
    }

    fn spawn_interactive(&self, script: &str, tty: bool) -> Result<Child> {
        let socket = self.session()?.control_socket();
        spawn_passthrough(SSH_PROGRAM, &interactive_args(socket, &self.host, script, tty), !tty)
    }

    fn transport_failure_code(&self) -> Option<i32> {
        Some(SSH_TRANSPORT_FAILURE)
    }

    fn forced_exit_hook(&self) -> Option<ExitHook> {
        let args = master_exit_args(self.session.as_ref()?.control_socket(), &self.host);
        Some(Box::new(move || {
            let _ = Command::new(SSH_PROGRAM)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.runtime.block_on(session.close()) {
                warn!(host = %self.host, %err, "failed to close ssh master connection");
            }
        }
    }
}

/// Maps a finished remote command; a severed connection reads as the ssh
/// client's own failure status.
fn settle(output: Result<Output, openssh::Error>) -> Result<RunOutput> {
    match output {
        Ok(output) => Ok(RunOutput {
            code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Err(openssh::Error::Disconnected) => Ok(RunOutput {
            code: SSH_TRANSPORT_FAILURE,
            stdout: String::new(),
            stderr: "connection to the remote host was lost".to_string(),
        }),
        Err(err) => Err(anyhow::Error::new(err).context("remote command failed")),
    }
}

fn interactive_args(socket: &Path, host: &str, script: &str, tty: bool) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-o".to_string(),
        "ControlMaster=no".to_string(),
        if tty { "-t" } else { "-T" }.to_string(),
        host.to_string(),
        "--".to_string(),
        format!("sh -c {}", shell_quote(script)),
    ]
}

fn master_exit_args(socket: &Path, host: &str) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-O".to_string(),
        "exit".to_string(),
        host.to_string(),
    ]
}

/// Runs scripts with the local `/bin/sh`; the target host is this machine.
#[derive(Clone, Debug)]
pub struct LocalShell {
    host: String,
}

impl LocalShell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
        }
    }

    fn args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteShell for LocalShell {
    fn host(&self) -> &str {
        &self.host
    }

    fn run(&self, script: &str) -> Result<RunOutput> {
        run_command("/bin/sh", &Self::args(script))
    }

    fn run_with_input(&self, script: &str, input: &mut dyn Read) -> Result<RunOutput> {
        run_command_with_input("/bin/sh", &Self::args(script), input)
    }

    fn spawn_interactive(&self, script: &str, tty: bool) -> Result<Child> {
        spawn_passthrough("/bin/sh", &Self::args(script), !tty)
    }

    fn transport_failure_code(&self) -> Option<i32> {
        None
    }
}
