//! Child process launching and supervision.
//!
//! Two ways to start the bundled program:
//! - [`Launcher::launch`] spawns the executable directly with inherited stdio.
//! - [`Launcher::relaunch_session`] goes through the system `open` tool,
//!   which starts the app as a grandchild; stdio crosses over three named
//!   pipes bridged by forwarder tasks.
//!
//! Either way the child becomes its own process-group leader, carries the
//! no-relaunch marker in its environment, has signals relayed to its group
//! and has its exit status translated into our exit code. A dedicated
//! thread reaps the child with `waitpid(WUNTRACED)` so stops are seen too;
//! [`JobControl`] decides what a stop means for this process.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bundlerun_core::{NO_RELAUNCH_ENV, RelaunchConfig};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forward::{BoxedReader, BoxedWriter, Endpoint, spawn_forwarder};
use crate::job::JobControl;
use crate::pipe::{PipeError, PipeGuard};
use crate::signal::{OsSignals, SignalRelay};

/// How long stdout/stderr may keep draining after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The outer process's stdio, as seen by the forwarders.
pub struct StdioStreams {
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
}

impl StdioStreams {
    /// This process's real stdin, stdout and stderr.
    pub fn inherit() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

/// Errors from launching and supervising a child.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn { program: PathBuf, source: io::Error },

    #[error("Failed to wait for child process: {source}")]
    Wait { source: io::Error },

    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(io::Error),
}

/// What the waiter thread saw happen to the child.
#[derive(Debug)]
enum ChildEvent {
    Stopped(Signal),
    Exited(ExitStatus),
    Lost(io::Error),
}

/// A spawned child, owned by the launcher. Its process group id equals its
/// pid.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    started_at: Instant,
    events: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildProcess {
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    pub const fn pgid(&self) -> Pid {
        self.pid
    }
}

/// Exit code the parent should use for a child's status: the child's own
/// code on a normal exit, 1 when it was killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Starts and supervises the bundled program.
#[derive(Debug, Clone, Default)]
pub struct Launcher {
    config: RelaunchConfig,
}

impl Launcher {
    pub const fn new(config: RelaunchConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &RelaunchConfig {
        &self.config
    }

    /// Run `program` as a direct child with inherited stdio and return its
    /// exit code.
    ///
    /// Cancelling `cancel` sends `SIGTERM` to the child's group and, after
    /// the grace period, `SIGKILL`.
    pub async fn launch(
        &self,
        cancel: &CancellationToken,
        program: &Path,
        args: &[OsString],
    ) -> Result<i32, LaunchError> {
        let signals = self.subscribe_signals();

        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let child = self.spawn(command, program)?;
        let job = Arc::new(JobControl::claim_terminal(child.pgid()));

        let status = self.supervise(cancel, child, signals, job).await?;
        Ok(exit_code(status))
    }

    /// Start `bundle` through the open tool with stdio bridged over named
    /// pipes and return the tool's exit code.
    ///
    /// The pipes are removed before this returns, whatever the outcome.
    pub async fn relaunch_session(
        &self,
        cancel: &CancellationToken,
        bundle: &Path,
        executable: &Path,
        args: &[OsString],
        stdio: StdioStreams,
    ) -> Result<i32, LaunchError> {
        let dir = self.config.pipe_dir();
        let prefix = &self.config.pipe_prefix;
        let stdin_pipe = PipeGuard::create(&dir, &format!("{prefix}-stdin"))?;
        let stdout_pipe = PipeGuard::create(&dir, &format!("{prefix}-stdout"))?;
        let stderr_pipe = PipeGuard::create(&dir, &format!("{prefix}-stderr"))?;

        info!(
            bundle = %bundle.display(),
            executable = %executable.display(),
            open_program = %self.config.open_program.display(),
            "Relaunching through bundle"
        );

        let signals = self.subscribe_signals();
        let session = CancellationToken::new();
        let StdioStreams {
            stdin,
            stdout,
            stderr,
        } = stdio;
        let stdin_task = spawn_forwarder(
            "stdin",
            session.clone(),
            stdin_pipe.path().to_path_buf(),
            Endpoint::Source(stdin),
        );
        let stdout_task = spawn_forwarder(
            "stdout",
            session.clone(),
            stdout_pipe.path().to_path_buf(),
            Endpoint::Sink(stdout),
        );
        let stderr_task = spawn_forwarder(
            "stderr",
            session.clone(),
            stderr_pipe.path().to_path_buf(),
            Endpoint::Sink(stderr),
        );

        let mut command = std::process::Command::new(&self.config.open_program);
        command
            .args(self.open_args(
                bundle,
                stdin_pipe.path(),
                stdout_pipe.path(),
                stderr_pipe.path(),
                args,
            ))
            .stdin(Stdio::null());
        let result = match self.spawn(command, &self.config.open_program) {
            Ok(child) => {
                // The open tool gets no terminal; the app is its own job.
                let job = Arc::new(JobControl::detached(child.pgid()));
                self.supervise(cancel, child, signals, job).await
            }
            Err(e) => Err(e),
        };

        // Output already in the pipes is still delivered; a peer that never
        // showed up is given up on after the drain timeout.
        let outputs = async {
            for (stream, task) in [("stdout", stdout_task), ("stderr", stderr_task)] {
                if let Err(e) = task.await {
                    debug!(stream, error = %e, "Forwarder task failed");
                }
            }
        };
        tokio::pin!(outputs);
        if result.is_err() {
            session.cancel();
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut outputs).await.is_err() {
            debug!("Output forwarders still waiting, cancelling session");
            session.cancel();
            outputs.await;
        }
        session.cancel();
        if let Err(e) = stdin_task.await {
            debug!(stream = "stdin", error = %e, "Forwarder task failed");
        }

        result.map(exit_code)
    }

    /// Run [`Launcher::relaunch_session`] with this process's stdio and
    /// exit with the result. Never returns.
    pub fn relaunch(&self, bundle: &Path, executable: &Path, args: &[OsString]) -> ! {
        run_to_exit("relaunch", || async {
            let cancel = CancellationToken::new();
            self.relaunch_session(&cancel, bundle, executable, args, StdioStreams::inherit())
                .await
        })
    }

    /// Run [`Launcher::launch`] and exit with the result. Never returns.
    pub fn launch_and_exit(&self, program: &Path, args: &[OsString]) -> ! {
        run_to_exit("launch", || async {
            let cancel = CancellationToken::new();
            self.launch(&cancel, program, args).await
        })
    }

    /// Arguments for the open tool: wait for the app, hand it the pipes for
    /// stdio and the no-relaunch marker for its environment.
    pub fn open_args(
        &self,
        bundle: &Path,
        stdin: &Path,
        stdout: &Path,
        stderr: &Path,
        args: &[OsString],
    ) -> Vec<OsString> {
        let mut out: Vec<OsString> = Vec::with_capacity(args.len() + 13);
        if self.config.new_instance {
            out.push("-n".into());
        }
        out.push("-W".into());
        out.push("-a".into());
        out.push(bundle.into());
        out.push("--env".into());
        out.push(format!("{NO_RELAUNCH_ENV}=1").into());
        out.push("--stdin".into());
        out.push(stdin.into());
        out.push("--stdout".into());
        out.push(stdout.into());
        out.push("--stderr".into());
        out.push(stderr.into());
        if !args.is_empty() {
            out.push("--args".into());
            out.extend(args.iter().cloned());
        }
        out
    }

    /// Subscribe before spawning so no signal slips through with its default
    /// action in between.
    fn subscribe_signals(&self) -> Option<OsSignals> {
        if !self.config.forward_signals {
            return None;
        }
        let signals = OsSignals::subscribe();
        if signals.is_empty() {
            warn!("Signal forwarding unavailable, child runs without it");
            return None;
        }
        Some(signals)
    }

    fn spawn(
        &self,
        mut command: std::process::Command,
        program: &Path,
    ) -> Result<ChildProcess, LaunchError> {
        // The marker keeps the child from relaunching itself again.
        command.env(NO_RELAUNCH_ENV, "1").process_group(0);

        // Reaped by the waiter thread rather than through the handle.
        #[allow(clippy::zombie_processes)]
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        let pid = i32::try_from(child.id())
            .map(Pid::from_raw)
            .map_err(|_| LaunchError::Wait {
                source: io::Error::other("child pid out of range"),
            })?;
        let events = match watch_child(pid) {
            Ok(events) => events,
            Err(source) => {
                if let Err(errno) = killpg(pid, Signal::SIGKILL) {
                    debug!(%pid, error = %errno, "Failed to kill unwatched child");
                }
                return Err(LaunchError::Wait { source });
            }
        };

        info!(program = %program.display(), %pid, "Spawned child process");
        Ok(ChildProcess {
            pid,
            started_at: Instant::now(),
            events,
        })
    }

    async fn supervise(
        &self,
        cancel: &CancellationToken,
        mut child: ChildProcess,
        signals: Option<OsSignals>,
        job: Arc<JobControl>,
    ) -> Result<ExitStatus, LaunchError> {
        let session = CancellationToken::new();
        let terminate_requested = CancellationToken::new();
        let relay = signals.map(|signals| {
            let relay = SignalRelay::new(signals, Arc::clone(&job), child.pgid())
                .notify_terminate(terminate_requested.clone());
            tokio::spawn(relay.run(session.clone()))
        });

        let status = self
            .wait_for_exit(cancel, &mut child, &job, &terminate_requested)
            .await;

        job.restore();
        session.cancel();
        if let Some(relay) = relay {
            if let Err(e) = relay.await {
                debug!(error = %e, "Signal relay task failed");
            }
        }

        let status = status?;
        info!(
            pid = %child.pid,
            ?status,
            elapsed_ms = child.started_at.elapsed().as_millis(),
            "Child process exited"
        );
        Ok(status)
    }

    /// Wait for the child. Once a termination request was forwarded (or the
    /// launch was cancelled) the child gets the configured grace period
    /// before its whole group is killed. Stops are handed to `job`.
    async fn wait_for_exit(
        &self,
        cancel: &CancellationToken,
        child: &mut ChildProcess,
        job: &JobControl,
        terminate_requested: &CancellationToken,
    ) -> Result<ExitStatus, LaunchError> {
        let pgid = child.pgid();
        let grace = self.config.terminate_grace();
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut killed = false;
        loop {
            let armed = deadline.filter(|_| !killed);
            let escalate = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                event = child.events.recv() => match event {
                    Some(ChildEvent::Exited(status)) => return Ok(status),
                    Some(ChildEvent::Stopped(sig)) => job.child_stopped(sig),
                    Some(ChildEvent::Lost(source)) => return Err(LaunchError::Wait { source }),
                    None => {
                        return Err(LaunchError::Wait {
                            source: io::Error::other("child waiter exited without a status"),
                        });
                    }
                },
                () = terminate_requested.cancelled(), if deadline.is_none() => {
                    debug!(%pgid, "Termination forwarded, starting grace period");
                    deadline = Some(tokio::time::Instant::now() + grace);
                }
                () = cancel.cancelled(), if deadline.is_none() => {
                    debug!(%pgid, "Launch cancelled, terminating child");
                    if let Err(errno) = killpg(pgid, Signal::SIGTERM) {
                        debug!(%pgid, error = %errno, "Failed to terminate child");
                    }
                    deadline = Some(tokio::time::Instant::now() + grace);
                }
                () = escalate => {
                    warn!(
                        %pgid,
                        grace_secs = grace.as_secs(),
                        "Child ignored termination, killing its process group"
                    );
                    if let Err(errno) = killpg(pgid, Signal::SIGKILL) {
                        debug!(%pgid, error = %errno, "Failed to kill child process group");
                    }
                    killed = true;
                }
            }
        }
    }
}

/// Reap `pid` on a dedicated thread, reporting stops as well as the final
/// status. The thread ends once the child is gone.
fn watch_child(pid: Pid) -> io::Result<mpsc::UnboundedReceiver<ChildEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("child-waiter".into())
        .spawn(move || {
            loop {
                let event = match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        ChildEvent::Exited(ExitStatus::from_raw(code << 8))
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        ChildEvent::Exited(ExitStatus::from_raw(sig as i32))
                    }
                    Ok(WaitStatus::Stopped(_, sig)) => ChildEvent::Stopped(sig),
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(errno) => ChildEvent::Lost(io::Error::from(errno)),
                };
                let last = !matches!(event, ChildEvent::Stopped(_));
                if tx.send(event).is_err() || last {
                    return;
                }
            }
        })?;
    Ok(rx)
}

/// Drive `session` on a fresh runtime and exit the process with its exit
/// code. Errors are reported as a single line on stderr and exit with 1.
#[allow(clippy::print_stderr)]
pub fn run_to_exit<F, Fut>(step: &str, session: F) -> !
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<i32, LaunchError>>,
{
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(LaunchError::Runtime)
        .and_then(|rt| {
            let result = rt.block_on(session());
            // Blocked stdin reads would otherwise hold up the runtime's drop.
            rt.shutdown_background();
            result
        });
    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("bundlerun: {step}: {e}");
            1
        }
    };
    std::process::exit(code)
}
