//! The fork/wait protocol.
//!
//! A forked child runs a closure and leaves through `_exit`, so no
//! destructor or atexit handler copied from the parent ever runs twice. The
//! parent blocks in `waitpid` until the child reaches a terminal state and
//! turns that state into a shell-style exit code.

use std::panic::{self, AssertUnwindSafe};

use bunker_common::constants::{EXIT_CHILD_FATAL, EXIT_FAILURE, SIGNAL_EXIT_BASE};
use bunker_common::error::{BunkerError, Result};
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

/// Forks, runs `child` in the new process, and waits for it.
///
/// The child exits with the closure's return value. A panic in the closure
/// is caught and becomes [`EXIT_CHILD_FATAL`] when panics unwind; under
/// `panic = "abort"` (the release profile) the child dies of `SIGABRT` and
/// the parent sees `134`. The parent returns the child's exit code as
/// computed by [`exit_code`].
///
/// # Errors
///
/// Returns [`BunkerError::Fork`] if `fork(2)` fails. Wait errors never
/// surface here; see [`wait_for_exit`].
pub fn fork_and_wait<F: FnOnce() -> i32>(child: F) -> Result<i32> {
    // SAFETY: the child branch never returns into the caller's frames: it
    // runs `child` and terminates through `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = panic::catch_unwind(AssertUnwindSafe(child)).unwrap_or(EXIT_CHILD_FATAL);
            exit_immediately(code)
        }
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(pid = child.as_raw(), "forked child");
            Ok(wait_for_exit(child))
        }
        Err(e) => Err(BunkerError::Fork { source: e.into() }),
    }
}

/// Terminates the calling process without unwinding, running destructors,
/// or flushing atexit handlers.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: `_exit` has no preconditions; it only ends this process.
    unsafe { libc::_exit(code) }
}

/// Exit code for a terminal wait status: the exit code of an exited child,
/// or `128 + signal` for a killed one. `None` for non-terminal statuses.
#[must_use]
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(SIGNAL_EXIT_BASE + signal as i32),
        _ => None,
    }
}

/// Blocks until `pid` exits or is killed and returns its exit code.
///
/// Interrupted waits and non-terminal statuses are retried. `ECHILD` means
/// the child can never be observed again and maps to [`EXIT_FAILURE`]. Any
/// other wait error is logged and the wait is retried.
pub fn wait_for_exit(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    tracing::debug!(pid = pid.as_raw(), code, "child reaped");
                    return code;
                }
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                tracing::error!(pid = pid.as_raw(), "child vanished before it could be reaped");
                return EXIT_FAILURE;
            }
            Err(e) => {
                let err = BunkerError::Wait {
                    pid: pid.as_raw(),
                    source: e.into(),
                };
                tracing::warn!(error = %err, "retrying wait");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::*;

    #[test]
    fn exit_code_of_exited_child() {
        let status = WaitStatus::Exited(Pid::from_raw(10), 42);
        assert_eq!(exit_code(status), Some(42));
    }

    #[test]
    fn exit_code_of_signaled_child() {
        let status = WaitStatus::Signaled(Pid::from_raw(10), Signal::SIGKILL, false);
        assert_eq!(exit_code(status), Some(137));
    }

    #[test]
    fn non_terminal_status_has_no_exit_code() {
        let status = WaitStatus::Stopped(Pid::from_raw(10), Signal::SIGSTOP);
        assert_eq!(exit_code(status), None);
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }

    #[test]
    fn child_return_value_reaches_parent() {
        assert_eq!(fork_and_wait(|| 42).unwrap(), 42);
        assert_eq!(fork_and_wait(|| 0).unwrap(), 0);
    }

    #[test]
    fn killed_child_reports_signal_code() {
        let code = fork_and_wait(|| {
            let _ = nix::sys::signal::raise(Signal::SIGKILL);
            0
        })
        .unwrap();
        assert_eq!(code, 137);
    }

    #[test]
    fn aborted_child_reports_sigabrt_code() {
        let status = WaitStatus::Signaled(Pid::from_raw(10), Signal::SIGABRT, true);
        assert_eq!(exit_code(status), Some(134));
        assert_eq!(fork_and_wait(|| -> i32 { std::process::abort() }).unwrap(), 134);
    }

    #[test]
    fn panicking_child_exits_with_fatal_code() {
        let code = fork_and_wait(|| -> i32 { panic!("child routine blew up") }).unwrap();
        assert_eq!(code, EXIT_CHILD_FATAL);
    }

    #[test]
    fn waiting_on_a_non_child_reports_failure() {
        assert_eq!(wait_for_exit(Pid::from_raw(1)), EXIT_FAILURE);
    }
}
