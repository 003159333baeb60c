use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use tokio::process::Command;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, warn};

use crate::command::ConversionCommand;
use crate::error::Error;

/// Default time a process gets to exit after a graceful stop request.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Details of a process that could not be waited on.
#[derive(Debug, Clone)]
pub struct ProcessFailure {
    /// A message describing the failure.
    pub message: String,
    /// The OS error code, if available.
    pub exit_code: Option<i32>,
}

/// A notification from the encoder process of run number `run`.
#[derive(Debug)]
pub enum RunnerEvent {
    /// Bytes read from the merged stdout/stderr stream, in arrival order.
    Output { run: u64, bytes: Vec<u8> },
    /// The process has terminated. Sent once per run, after all of its output.
    Finished {
        run: u64,
        result: Result<ExitStatus, ProcessFailure>,
    },
}

impl RunnerEvent {
    pub fn run(&self) -> u64 {
        match self {
            RunnerEvent::Output { run, .. } | RunnerEvent::Finished { run, .. } => *run,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Idle,
    Running,
    Exited { success: bool },
}

/// Owns the one encoder process that may run at a time.
///
/// Output and termination are delivered on the event channel given to
/// [`ProcessRunner::new`].
#[derive(Debug)]
pub struct ProcessRunner {
    events: mpsc::UnboundedSender<RunnerEvent>,
    run: u64,
    pid: Option<u32>,
    kill_tx: Option<mpsc::Sender<()>>,
    state: watch::Receiver<ProcessState>,
    grace: Duration,
}

impl ProcessRunner {
    pub fn new(events: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        let (_, state) = watch::channel(ProcessState::Idle);
        Self {
            events,
            run: 0,
            pid: None,
            kill_tx: None,
            state,
            grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Sets how long a stopped process may take to exit before it is killed.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The number of the most recently started run.
    pub fn current_run(&self) -> u64 {
        self.run
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == ProcessState::Running
    }

    /// Whether the last process exited on its own with a success status.
    pub fn exited_normally(&self) -> bool {
        *self.state.borrow() == ProcessState::Exited { success: true }
    }

    /// Spawns the encoder with both output streams captured, returning the run number.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if a process is still running or if the process could not be spawned.
    pub fn start(&mut self, command: &ConversionCommand) -> Result<u64, Error> {
        if self.is_running() {
            return Err(Error::ProcessSpawnFailed {
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "an encoder process is already running",
                ),
            });
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed { source: e })?;

        let stdout = child
            .stdout
            .take()
            .expect("BUG: stdout was not captured. This should not happen when piping.");
        let stderr = child
            .stderr
            .take()
            .expect("BUG: stderr was not captured. This should not happen when piping.");

        self.run += 1;
        let run = self.run;
        self.pid = child.id();
        info!(run, pid = ?self.pid, program = %command.program.display(), "encoder started");

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        self.state = state_rx;
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        self.kill_tx = Some(kill_tx);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut stdout_reader = FramedRead::new(stdout, BytesCodec::new());
            let mut stderr_reader = FramedRead::new(stderr, BytesCodec::new());
            let (mut stdout_open, mut stderr_open) = (true, true);
            let mut status = None;

            // Finished goes out only once the child is reaped and both streams hit EOF
            while stdout_open || stderr_open || status.is_none() {
                let chunk = select! {
                    chunk = stdout_reader.next(), if stdout_open => match chunk {
                        Some(Ok(bytes)) => Some(bytes),
                        _ => {
                            stdout_open = false;
                            None
                        }
                    },
                    chunk = stderr_reader.next(), if stderr_open => match chunk {
                        Some(Ok(bytes)) => Some(bytes),
                        _ => {
                            stderr_open = false;
                            None
                        }
                    },
                    exit = child.wait(), if status.is_none() => {
                        let success = matches!(&exit, Ok(s) if s.success());
                        let _ = state_tx.send(ProcessState::Exited { success });
                        status = Some(exit);
                        None
                    },
                    Some(()) = kill_rx.recv(), if status.is_none() => {
                        if let Err(e) = child.start_kill() {
                            warn!(run, error = %e, "failed to kill encoder");
                        }
                        None
                    }
                };

                // unbounded, the receiver may be inside stop() for this very process
                if let Some(bytes) = chunk {
                    let _ = events.send(RunnerEvent::Output {
                        run,
                        bytes: bytes.to_vec(),
                    });
                }
            }

            let status = status.unwrap_or_else(|| Err(io::Error::other("process was not reaped")));
            let result = match status {
                Ok(status) => {
                    debug!(run, ?status, "encoder exited");
                    Ok(status)
                }
                Err(e) => Err(ProcessFailure {
                    message: format!("Failed: {}", e),
                    exit_code: e.raw_os_error(),
                }),
            };
            let _ = events.send(RunnerEvent::Finished { run, result });
        });

        Ok(run)
    }

    /// Asks the process to shut down and waits for it to exit.
    ///
    /// - On Unix, it sends a `SIGINT` signal.
    /// - On Windows, it sends a `CTRL_BREAK_EVENT`.
    ///
    /// If the process is still alive after the grace period it is killed.
    /// Stopping a runner with no live process does nothing.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if !self.is_running() {
            return Ok(());
        }

        if let Err(e) = self.interrupt() {
            warn!(run = self.run, error = %e, "graceful stop failed, killing encoder");
            return self.kill_and_wait().await;
        }

        if self.wait_for_exit(self.grace).await {
            debug!(run = self.run, "encoder stopped gracefully");
            return Ok(());
        }

        warn!(run = self.run, grace = ?self.grace, "encoder ignored stop request, killing it");
        self.kill_and_wait().await
    }

    /// Forcefully terminates the process immediately.
    ///
    /// This may leave a corrupt output file behind.
    pub fn kill(&mut self) -> Result<(), Error> {
        if !self.is_running() {
            return Ok(());
        }
        match &self.kill_tx {
            Some(tx) => {
                // a full channel means a kill is already pending, a closed one that the
                // process is gone
                let _ = tx.try_send(());
                Ok(())
            }
            None => Err(Error::ControlFailed {
                action: "kill",
                source: io::Error::new(io::ErrorKind::NotFound, "no process handle"),
            }),
        }
    }

    async fn kill_and_wait(&mut self) -> Result<(), Error> {
        self.kill()?;
        if self.wait_for_exit(self.grace).await {
            Ok(())
        } else {
            Err(Error::ControlFailed {
                action: "kill",
                source: io::Error::new(io::ErrorKind::TimedOut, "process did not exit"),
            })
        }
    }

    /// Waits up to `limit` for the process to exit. Returns whether it did.
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut state = self.state.clone();
        let exited = tokio::time::timeout(
            limit,
            state.wait_for(|s| matches!(s, ProcessState::Exited { .. })),
        )
        .await;
        matches!(exited, Ok(Ok(_)))
    }

    fn interrupt(&self) -> Result<(), Error> {
        let control_failed = |source| Error::ControlFailed {
            action: "stop",
            source,
        };
        let pid = self
            .pid
            .ok_or_else(|| control_failed(io::Error::new(io::ErrorKind::NotFound, "no encoder pid")))?;
        debug!(run = self.run, pid, "interrupting encoder");
        request_quit(pid).map_err(control_failed)
    }
}

/// Asks the encoder to finish up as if the user had pressed Ctrl+C in its console.
#[cfg(unix)]
fn request_quit(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(io::Error::from)
}

/// The encoder runs in its own process group, whose id is its pid.
#[cfg(windows)]
fn request_quit(pid: u32) -> io::Result<()> {
    use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

    if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
fn request_quit(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "graceful stop is not supported on this platform"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str) -> ConversionCommand {
        ConversionCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            output: PathBuf::from("/dev/null"),
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> (Vec<u8>, Result<ExitStatus, ProcessFailure>) {
        let mut output = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                RunnerEvent::Output { bytes, .. } => output.extend(bytes),
                RunnerEvent::Finished { result, .. } => return (output, result),
            }
        }
        panic!("runner closed without a Finished event");
    }

    #[tokio::test]
    async fn test_output_precedes_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ProcessRunner::new(tx);
        let run = runner.start(&shell("echo one; echo two >&2; exit 0")).unwrap();
        assert_eq!(run, 1);

        let (output, result) = collect(&mut rx).await;
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("one"));
        assert!(text.contains("two"));
        assert!(result.unwrap().success());
        assert!(runner.exited_normally());
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_failing_exit_is_not_normal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ProcessRunner::new(tx);
        runner.start(&shell("exit 3")).unwrap();

        let (_, result) = collect(&mut rx).await;
        assert_eq!(result.unwrap().code(), Some(3));
        assert!(!runner.exited_normally());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner =
            ProcessRunner::new(tx).with_grace_period(Duration::from_millis(200));
        runner
            .start(&shell("trap '' INT; while true; do sleep 1; done"))
            .unwrap();

        runner.stop().await.unwrap();
        assert!(!runner.is_running());

        let (_, result) = collect(&mut rx).await;
        assert!(!result.unwrap().success());
        // stopping again is a no-op
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_gracefully() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = ProcessRunner::new(tx).with_grace_period(Duration::from_secs(5));
        runner.start(&shell("exec sleep 30")).unwrap();

        let started = std::time::Instant::now();
        runner.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5), "SIGINT should end the process");

        let (_, result) = collect(&mut rx).await;
        let status = result.unwrap();
        assert_eq!(status.code(), None);
        assert!(!runner.exited_normally());
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut runner = ProcessRunner::new(tx);
        let command = ConversionCommand {
            program: PathBuf::from("/definitely/not/an/encoder"),
            args: Vec::new(),
            output: PathBuf::from("/dev/null"),
        };
        assert!(matches!(
            runner.start(&command),
            Err(Error::ProcessSpawnFailed { .. })
        ));
        assert_eq!(runner.current_run(), 0);
    }
}
