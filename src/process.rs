//! Subprocess execution under a hard wall-clock limit.
//!
//! A run spawns one process with captured stdout/stderr, optionally feeds it
//! stdin, and waits for it to exit. When the timeout fires, the run is marked
//! timed out and the workload is terminated: either by signalling the local
//! process group, or, when the direct child is only a container-engine
//! client, by issuing an out-of-band `kill` against the container name.
//!
//! A non-zero exit code is ordinary data. Only failures of the runner itself
//! (the program cannot be spawned, a pipe breaks) are errors.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, instrument, warn};

/// How long a terminated workload gets to exit and release its pipes before
/// the direct child is killed and the pipes are abandoned.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on the out-of-band `<engine> kill` command.
const KILL_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of the runner itself, as opposed to the program it ran.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to {action} {program}: {source}")]
    Io {
        action: &'static str,
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What to terminate when the timeout fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    /// Signal the spawned process and everything in its process group.
    Process,
    /// Ask the engine to kill a named container; the spawned process is
    /// only a client of the engine daemon.
    Container { engine: String, name: String },
}

/// A command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to stdin, which is then closed. `None` attaches `/dev/null`.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub kill: KillTarget,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout,
            kill: KillTarget::Process,
        }
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn kill_container(mut self, engine: impl Into<String>, name: impl Into<String>) -> Self {
        self.kill = KillTarget::Container {
            engine: engine.into(),
            name: name.into(),
        };
        self
    }

    /// Program and arguments as one vector.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Captured result of a finished (or killed) command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `128 + signal` when the process was killed by a signal.
    pub exit_code: i32,
    pub timed_out: bool,
    /// Measured from spawn to exit.
    pub runtime: Duration,
}

impl CommandOutput {
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs commands. Abstracted so the sandbox can be exercised without
/// a container engine.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// Runner backed by real OS processes.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    #[instrument(skip(self, spec), fields(program = %spec.program, timeout_ms = spec.timeout.as_millis()))]
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a timeout also reaches anything the program forked.
        #[cfg(unix)]
        if spec.kill == KillTarget::Process {
            cmd.process_group(0);
        }

        let io_error = |action: &'static str| {
            let program = spec.program.clone();
            move |source| ProcessError::Io {
                action,
                program,
                source,
            }
        };

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Pipes live outside the timed futures so output read before a kill is kept.
        let child_stdin = child.stdin.take();
        let mut child_stdout = child.stdout.take();
        let mut child_stderr = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        // The deadline covers process exit as well as the pipes: a program that
        // closes its output early is still bounded.
        let to_exit = async {
            let (fed, out, err, status) = tokio::join!(
                feed(child_stdin, spec.stdin.as_deref()),
                drain(child_stdout.as_mut(), &mut stdout_buf),
                drain(child_stderr.as_mut(), &mut stderr_buf),
                child.wait(),
            );
            fed.map_err(io_error("write stdin of"))?;
            out.map_err(io_error("read stdout of"))?;
            err.map_err(io_error("read stderr of"))?;
            status.map_err(io_error("wait for"))
        };

        let finished = tokio::time::timeout(spec.timeout, to_exit).await;
        let (status, timed_out) = match finished {
            Ok(status) => (status?, false),
            Err(_) => {
                debug!(command = %spec, "Timed out, terminating");
                terminate(&mut child, &spec.kill).await;

                let settle = async {
                    let (_, _, status) = tokio::join!(
                        drain(child_stdout.as_mut(), &mut stdout_buf),
                        drain(child_stderr.as_mut(), &mut stderr_buf),
                        child.wait(),
                    );
                    status
                };
                let settled = tokio::time::timeout(KILL_GRACE, settle).await;
                let status = if let Ok(status) = settled {
                    status
                } else {
                    // Something outside our reach still holds the pipes; abandon them.
                    warn!(command = %spec, "Workload still holds its pipes after kill, killing client");
                    signal_process(&mut child);
                    child.wait().await
                };
                (status.map_err(io_error("wait for"))?, true)
            }
        };

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            exit_code: exit_code(status),
            timed_out,
            runtime: started.elapsed(),
        };

        debug!(
            exit_code = output.exit_code,
            timed_out,
            runtime_ms = output.runtime.as_millis(),
            "Command finished"
        );

        Ok(output)
    }
}

/// Write `input` and close stdin.
async fn feed(pipe: Option<ChildStdin>, input: Option<&[u8]>) -> std::io::Result<()> {
    if let (Some(mut pipe), Some(input)) = (pipe, input) {
        match pipe.write_all(input).await {
            // The program may exit without consuming its input.
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
            _ => {}
        }
        drop(pipe); // EOF
    }
    Ok(())
}

/// Read `pipe` to EOF into `buf`. Cancel-safe: bytes read so far stay in `buf`.
async fn drain<R>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Best effort: an already-exited workload is not an error.
async fn terminate(child: &mut Child, target: &KillTarget) {
    match target {
        KillTarget::Process => signal_process(child),
        KillTarget::Container { engine, name } => {
            let status = Command::new(engine)
                .args(["kill", name.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();
            match tokio::time::timeout(KILL_COMMAND_TIMEOUT, status).await {
                Ok(Ok(status)) if !status.success() => {
                    debug!(container = %name, ?status, "Container kill reported failure");
                }
                Ok(Err(e)) => debug!(container = %name, error = %e, "Container kill could not be issued"),
                Err(_) => warn!(container = %name, "Container kill did not return in time"),
                Ok(Ok(_)) => {}
            }
        }
    }
}

fn signal_process(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // The group leader is our child; members it forked share its pgid.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Scripted runner for tests: records every command and answers from a closure.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::{CommandOutput, CommandRunner, CommandSpec, ProcessError};

    type Responder = dyn Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync;

    pub struct FakeRunner {
        calls: Mutex<Vec<CommandSpec>>,
        respond: Box<Responder>,
    }

    impl FakeRunner {
        pub fn new<F>(respond: F) -> Self
        where
            F: Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        /// Commands whose first argument is `subcommand` (e.g. `pull`, `run`).
        pub fn count(&self, subcommand: &str) -> usize {
            self.calls()
                .iter()
                .filter(|spec| spec.args.first().map(String::as_str) == Some(subcommand))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, ProcessError> {
            let result = (self.respond)(&spec);
            self.calls.lock().unwrap().push(spec);
            result
        }
    }

    pub fn exited(code: i32, stdout: &str, stderr: &str) -> Result<CommandOutput, ProcessError> {
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: code,
            ..CommandOutput::default()
        })
    }

    pub fn timed_out() -> Result<CommandOutput, ProcessError> {
        Ok(CommandOutput {
            exit_code: 137,
            timed_out: true,
            ..CommandOutput::default()
        })
    }

    pub fn not_installed(program: &str) -> Result<CommandOutput, ProcessError> {
        Err(ProcessError::Spawn {
            program: program.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}
