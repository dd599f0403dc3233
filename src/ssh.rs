//! Seam to the SSH transport.
//!
//! The transport library is a collaborator: callers bring their own
//! [`SshSession`] implementation. This module defines the interface, the
//! result of one remote command, and the helpers the mount bootstrap uses
//! to run its command sequence.

use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::errors::{MountError, SshError};

/// Outcome of one remote command run over an SSH channel.
///
/// Implementations read both streams to completion with a bounded timeout
/// before reporting the exit code.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout with trailing whitespace removed; remote probes answer with a
    /// single line.
    pub fn stdout_line(&self) -> String {
        self.stdout.trim_end().to_string()
    }
}

/// One established SSH session. Exactly one channel is used at a time: the
/// bootstrap commands run sequentially, then the session is handed to the
/// SFTP bridge for the remainder of its life.
pub trait SshSession: Send {
    /// Run `cmd` on the remote side and collect its result.
    fn exec(&mut self, cmd: &str) -> Result<ExecResult, SshError>;

    /// Start a long-lived remote process on the session's channel without
    /// waiting for it to exit. Used to launch the sshfs slave bridge.
    fn exec_detached(&mut self, cmd: &str) -> Result<(), SshError>;
}

/// Run a remote command, mapping a non-zero exit through `error_handler`.
pub fn run_cmd_with(
    session: &mut dyn SshSession,
    cmd: &str,
    error_handler: impl FnOnce(ExecResult) -> MountError,
) -> Result<String, MountError> {
    let result = session.exec(cmd)?;
    if !result.success() {
        return Err(error_handler(result));
    }
    Ok(result.stdout)
}

/// Run a remote command, failing with command context on non-zero exit.
pub fn run_cmd(session: &mut dyn SshSession, cmd: &str) -> Result<String, MountError> {
    run_cmd_with(session, cmd, |result| MountError::Remote {
        command: cmd.to_string(),
        stderr: result.stderr.trim_end().to_string(),
    })
}

/// Reachability probe used while waiting for a guest's SSH endpoint to come
/// up. Kept behind a trait so the lifecycle controller stays independent of
/// the transport.
pub trait SshReachability: Send + Sync {
    fn can_connect(&self, host: &str, port: u16) -> bool;
}

/// Default probe: a plain TCP connect with a short timeout.
#[derive(Debug, Default)]
pub struct TcpReachability;

impl SshReachability for TcpReachability {
    fn can_connect(&self, host: &str, port: u16) -> bool {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => return false,
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok() {
                return true;
            }
        }
        false
    }
}
