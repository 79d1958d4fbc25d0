use std::{
    io::{self, Read, Write},
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};

/// Bytes kept per captured stream; older output is dropped first.
const CAPTURE_LIMIT: usize = 1024 * 1024;
const TRUNCATED: &str = "[...truncated...]\n";

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Last non-empty stderr line, for compact error messages.
    #[must_use]
    pub fn stderr_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .to_string()
    }
}

/// Runs `program` with stdin closed and captures both output streams.
///
/// # Errors
///
/// Fails when the program cannot be started or its output cannot be read.
pub fn run_command(program: &str, args: &[String]) -> Result<RunOutput> {
    let mut child = spawn_captured(program, args, Stdio::null())?;
    let capture = Capture::start(program, &mut child)?;
    capture.finish(program, child)
}

/// Runs `program` with `input` streamed into its stdin.
///
/// A child that exits before draining its input is reported through its exit
/// status rather than as a broken pipe.
///
/// # Errors
///
/// Fails when the program cannot be started or `input` cannot be read.
pub fn run_command_with_input(
    program: &str,
    args: &[String],
    input: &mut dyn Read,
) -> Result<RunOutput> {
    let mut child = spawn_captured(program, args, Stdio::piped())?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("{program} has no stdin pipe"))?;
    let capture = Capture::start(program, &mut child)?;

    let streamed = io::copy(input, &mut stdin);
    drop(stdin);
    if let Err(err) = streamed {
        if err.kind() != io::ErrorKind::BrokenPipe {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err).with_context(|| format!("streaming input to {program}"));
        }
    }
    capture.finish(program, child)
}

/// Starts `program` with this process's standard streams.
///
/// With `own_group` the child leads a new process group and does not see
/// terminal-generated signals meant for us.
///
/// # Errors
///
/// Fails when the program cannot be started.
pub fn spawn_passthrough(program: &str, args: &[String], own_group: bool) -> Result<Child> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    #[cfg(unix)]
    if own_group {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = own_group;
    command
        .spawn()
        .with_context(|| format!("failed to start {program}"))
}

/// Exit code of a finished process; signals map to `128 + signal` like a shell.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Flushes our own output before a child takes over the terminal.
pub(crate) fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn spawn_captured(program: &str, args: &[String], stdin: Stdio) -> Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {program}"))
}

/// Reader threads draining a child's stdout and stderr so neither pipe fills.
struct Capture {
    stdout: JoinHandle<io::Result<TailBuffer>>,
    stderr: JoinHandle<io::Result<TailBuffer>>,
}

impl Capture {
    fn start(program: &str, child: &mut Child) -> Result<Self> {
        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{program} has no stdout pipe"))?;
        let stderr: ChildStderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("{program} has no stderr pipe"))?;
        Ok(Self {
            stdout: thread::spawn(move || TailBuffer::drain(stdout, CAPTURE_LIMIT)),
            stderr: thread::spawn(move || TailBuffer::drain(stderr, CAPTURE_LIMIT)),
        })
    }

    fn finish(self, program: &str, mut child: Child) -> Result<RunOutput> {
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for {program}"))?;
        let stdout = join_stream(self.stdout, program, "stdout")?;
        let stderr = join_stream(self.stderr, program, "stderr")?;
        Ok(RunOutput {
            code: exit_code(status),
            stdout,
            stderr,
        })
    }
}

fn join_stream(
    handle: JoinHandle<io::Result<TailBuffer>>,
    program: &str,
    stream: &str,
) -> Result<String> {
    let buffer = handle
        .join()
        .map_err(|_| anyhow!("{stream} reader for {program} panicked"))?
        .with_context(|| format!("reading {stream} of {program}"))?;
    Ok(buffer.into_string())
}

/// Keeps the last `limit` bytes written to it.
struct TailBuffer {
    bytes: Vec<u8>,
    limit: usize,
    dropped: bool,
}

impl TailBuffer {
    fn drain(mut reader: impl Read, limit: usize) -> io::Result<Self> {
        let mut tail = Self {
            bytes: Vec::new(),
            limit,
            dropped: false,
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk)? {
                0 => return Ok(tail),
                read => tail.push(&chunk[..read]),
            }
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
            self.dropped = true;
        }
    }

    fn into_string(self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        if self.dropped {
            format!("{TRUNCATED}{text}")
        } else {
            text.into_owned()
        }
    }
}
