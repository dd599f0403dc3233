//! Child process abstraction for the QEMU backend.
//!
//! A [`QemuProcess`] owns one spawned child. Reader threads feed stdout and
//! stderr lines into a single event channel, and a waiter thread reports
//! the exit; the lifecycle controller consumes the channel from its own
//! pump thread.

use std::{
    io::{self, BufRead, BufReader, Write},
    os::unix::process::ExitStatusExt,
    process::{ChildStdin, Command, Stdio},
    sync::{mpsc, Arc, Condvar, Mutex},
    thread,
};

use anyhow::{bail, Context, Result};
use libc::pid_t;
use tracing::{debug, warn};

use super::spec::QemuProcessSpec;

/// How a child exited: a code, a signal, or both unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatusInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), None) => format!("exit code {}", code),
            (None, Some(sig)) => format!("signal {}", sig),
            (Some(code), Some(sig)) => format!("exit code {} (signal {})", code, sig),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// OS-level run state of the child, reported around spawn and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRunState {
    Running,
    NotRunning,
}

/// Events emitted by a [`ProcessHandle`], in occurrence order.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    StateChanged(ProcessRunState),
    Started,
    /// One line of standard output.
    Stdout(String),
    /// One line of standard error.
    Stderr(String),
    /// The child terminated abnormally (killed or crashed).
    Error(String),
    Finished(ExitStatusInfo),
}

/// A controllable child process.
pub trait ProcessHandle: Send + Sync {
    /// Spawn the child with `extra_args` appended to the base arguments.
    fn start(&self, extra_args: &[String]) -> Result<()>;

    /// Write to the child's stdin.
    fn write_stdin(&self, data: &[u8]) -> Result<()>;

    /// Deliver SIGKILL. Idempotent; a child that already exited is fine.
    fn kill(&self);

    fn running(&self) -> bool;

    /// Block until the child exits. `None` if it was never started.
    fn wait_for_finished(&self) -> Option<ExitStatusInfo>;
}

/// Creates process handles from a QEMU argument spec.
pub trait ProcessFactory: Send + Sync {
    fn create_process(
        &self,
        spec: &QemuProcessSpec,
    ) -> Result<(Arc<dyn ProcessHandle>, mpsc::Receiver<ProcessEvent>)>;
}

/// Factory spawning real children on the host.
#[derive(Debug, Default)]
pub struct HostProcessFactory;

impl ProcessFactory for HostProcessFactory {
    fn create_process(
        &self,
        spec: &QemuProcessSpec,
    ) -> Result<(Arc<dyn ProcessHandle>, mpsc::Receiver<ProcessEvent>)> {
        let (process, events) = QemuProcess::new(spec.program(), spec.arguments().to_vec());
        Ok((process, events))
    }
}

/// Exit information shared between the handle and the waiter thread.
#[derive(Default)]
struct ExitSlot {
    exit: Mutex<Option<ExitStatusInfo>>,
    reaped: Condvar,
}

impl ExitSlot {
    fn record(&self, exit: ExitStatusInfo) {
        let mut slot = self.exit.lock().expect("poisoned exit slot mutex");
        *slot = Some(exit);
        drop(slot);
        self.reaped.notify_all();
    }

    fn get(&self) -> Option<ExitStatusInfo> {
        *self.exit.lock().expect("poisoned exit slot mutex")
    }

    fn wait(&self) -> ExitStatusInfo {
        let mut slot = self.exit.lock().expect("poisoned exit slot mutex");
        loop {
            if let Some(exit) = *slot {
                return exit;
            }
            slot = self.reaped.wait(slot).expect("poisoned exit slot mutex");
        }
    }
}

/// [`ProcessHandle`] implementation over [`std::process`].
pub struct QemuProcess {
    program: String,
    base_args: Vec<String>,
    stdin: Mutex<Option<ChildStdin>>,
    pid: Mutex<Option<pid_t>>,
    exit: Arc<ExitSlot>,
    // Taken at start; once the reader and waiter threads drop their clones
    // the event channel closes and the consumer's loop ends.
    events: Mutex<Option<mpsc::Sender<ProcessEvent>>>,
}

impl QemuProcess {
    pub fn new(
        program: impl Into<String>,
        base_args: Vec<String>,
    ) -> (Arc<Self>, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel();
        let process = Arc::new(Self {
            program: program.into(),
            base_args,
            stdin: Mutex::new(None),
            pid: Mutex::new(None),
            exit: Arc::new(ExitSlot::default()),
            events: Mutex::new(Some(tx)),
        });
        (process, rx)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.base_args
    }
}

impl ProcessHandle for QemuProcess {
    fn start(&self, extra_args: &[String]) -> Result<()> {
        let events = self
            .events
            .lock()
            .expect("poisoned process events mutex")
            .take();
        let Some(events) = events else {
            bail!("process already started");
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(target: "qvmctl", "spawning {} {:?} {:?}", self.program, self.base_args, extra_args);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                // Drop the sender so the consumer's event loop terminates.
                drop(events);
                return Err(err).with_context(|| format!("spawning {}", self.program));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.stdin.lock().expect("poisoned stdin mutex") = child.stdin.take();
        *self.pid.lock().expect("poisoned pid mutex") = Some(child.id() as pid_t);

        let _ = events.send(ProcessEvent::StateChanged(ProcessRunState::Running));
        let _ = events.send(ProcessEvent::Started);

        if let Some(stdout) = stdout {
            let tx = events.clone();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            let _ = tx.send(ProcessEvent::Stdout(line));
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        if let Some(stderr) = stderr {
            let tx = events.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => {
                            let _ = tx.send(ProcessEvent::Stderr(line));
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        // Waiter thread: reap the child, record the exit, wake blocked
        // callers and publish the terminal events.
        let slot = Arc::clone(&self.exit);
        thread::spawn(move || {
            let exit = match child.wait() {
                Ok(status) => ExitStatusInfo {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(err) => {
                    warn!(target: "qvmctl", "waiting for child failed: {}", err);
                    ExitStatusInfo {
                        code: None,
                        signal: None,
                    }
                }
            };

            slot.record(exit);

            if exit.signal.is_some() {
                let _ = events.send(ProcessEvent::Error(format!(
                    "process terminated by {}",
                    exit.describe()
                )));
            }
            let _ = events.send(ProcessEvent::StateChanged(ProcessRunState::NotRunning));
            let _ = events.send(ProcessEvent::Finished(exit));
        });

        Ok(())
    }

    fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().expect("poisoned stdin mutex");
        let stdin = stdin.as_mut().context("process stdin is not open")?;
        stdin.write_all(data)?;
        stdin.flush()?;
        Ok(())
    }

    fn kill(&self) {
        if self.exit.get().is_some() {
            return;
        }
        let pid = *self.pid.lock().expect("poisoned pid mutex");
        if let Some(pid) = pid {
            let result = unsafe { libc::kill(pid, libc::SIGKILL) };
            if result != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(target: "qvmctl", "kill({}) failed: {}", pid, err);
                }
            }
        }
    }

    fn running(&self) -> bool {
        self.pid.lock().expect("poisoned pid mutex").is_some() && self.exit.get().is_none()
    }

    fn wait_for_finished(&self) -> Option<ExitStatusInfo> {
        if self.pid.lock().expect("poisoned pid mutex").is_none() {
            return None;
        }
        Some(self.exit.wait())
    }
}
