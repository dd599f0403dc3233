use std::{
    process::Command,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, trace};

/// Pause between retries of a timed action.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Outcome of one attempt inside [`try_action_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    Done,
    Retry,
}

/// Drive `action` until it reports [`TimeoutAction::Done`], the budget runs
/// out, or the action fails outright.
///
/// An `Err` from the action aborts the loop immediately; exhausting the
/// budget produces the error built by `on_timeout`.
pub fn try_action_for<E>(
    on_timeout: impl FnOnce() -> E,
    budget: Duration,
    mut action: impl FnMut() -> Result<TimeoutAction, E>,
) -> Result<(), E> {
    let deadline = Instant::now() + budget;
    loop {
        match action()? {
            TimeoutAction::Done => return Ok(()),
            TimeoutAction::Retry => {
                if Instant::now() >= deadline {
                    return Err(on_timeout());
                }
                thread::sleep(RETRY_PAUSE);
            }
        }
    }
}

/// Run a host command and report whether it exited successfully.
pub fn run_cmd_for_status(cmd: &str, args: &[&str]) -> bool {
    match Command::new(cmd).args(args).status() {
        Ok(status) => status.success(),
        Err(err) => {
            debug!(target: "qvmctl", "run_cmd_for_status: {} {:?} failed to launch: {}", cmd, args, err);
            false
        }
    }
}

/// Run a host command and capture trimmed stdout, failing on non-zero exit.
pub fn run_cmd_for_output(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("launching {} {:?}", cmd, args))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    trace!(target: "qvmctl", "run_cmd_for_output: {} {:?} stdout: {}", cmd, args, stdout.trim());

    if !output.status.success() {
        return Err(anyhow!(
            "command {} {:?} failed: {}",
            cmd,
            args,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(stdout.trim().to_string())
}

/// First line of `output` containing `matcher`, if any.
pub fn match_line_for<'a>(output: &'a str, matcher: &str) -> Option<&'a str> {
    output.lines().find(|line| line.contains(matcher))
}
