//! Subprocess execution with a hard wall-clock limit.
//!
//! Lifecycle flows shell out to `systemctl`, `dmidecode` and friends.
//! Every invocation takes an explicit wait budget; on expiry the child
//! is killed and the call returns `Timeout`.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::CommonError;

/// Default subprocess wait budget.
pub const DEFAULT_WAIT_SECS: u64 = 180;
/// Smallest accepted wait budget.
pub const MIN_WAIT_SECS: u64 = 30;

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct ExecOutput {
    pub status_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

// Pipes must be drained while the child runs; a child that fills the
// kernel pipe buffer blocks on write and never exits.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

/// Run `program args..` and wait at most `wait_secs`.
///
/// A non-positive or sub-minimum budget is clamped up to
/// [`MIN_WAIT_SECS`] rather than rejected; callers that need strict
/// validation do it at the CLI boundary.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    wait_secs: u64,
) -> Result<ExecOutput, CommonError> {
    let wait_secs = wait_secs.max(MIN_WAIT_SECS);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    // The waiter thread owns the child and reports exactly once.
    let (done_tx, done_rx) = mpsc::channel();
    let pid = child.id();
    let waiter = std::thread::spawn(move || {
        let status = child.wait();
        let _ = done_tx.send(status);
    });

    let status = match done_rx.recv_timeout(Duration::from_secs(wait_secs)) {
        Ok(status) => status?,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(program, pid, wait_secs, "subprocess timed out, killing");
            // SAFETY: pid refers to our direct child.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            let _ = waiter.join();
            let _ = stdout.join();
            let _ = stderr.join();
            return Err(CommonError::Timeout(wait_secs));
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(CommonError::ParamInvalid("subprocess waiter vanished".into()));
        }
    };
    let _ = waiter.join();

    Ok(ExecOutput {
        status_ok: status.success(),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Run with the default wait budget.
pub fn run(program: &str, args: &[&str]) -> Result<ExecOutput, CommonError> {
    run_with_timeout(program, args, DEFAULT_WAIT_SECS)
}
