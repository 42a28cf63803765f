//! Entry-point flow: checks, the outer fork, and the container run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use bunker_common::config::Context;
use bunker_common::constants::{EXIT_FAILURE, UMASK};
use bunker_common::error::BunkerError;
use bunker_core::fork;
use bunker_runtime::container::Container;
use bunker_runtime::process::Process;
use nix::sys::stat::{Mode, umask};
use nix::unistd::geteuid;

use crate::cli::{BindRequest, Cli};

/// Runs the jail described by `cli` and returns the exit code to leave with.
///
/// Namespace detachment happens in a forked child so this process stays in
/// the host namespaces and only waits.
///
/// # Errors
///
/// Returns an error if bunker is not running as root, the configuration is
/// invalid, or the child cannot be forked.
pub fn execute(cli: &Cli) -> anyhow::Result<i32> {
    if !geteuid().is_root() {
        return Err(BunkerError::PermissionDenied {
            message: "bunker must be run as root".into(),
        }
        .into());
    }
    let _ = umask(Mode::from_bits_truncate(UMASK));

    let ctx = cli.context().context("failed to build jail configuration")?;
    ctx.validate()?;
    let argv = cli.command_line();
    let process = Process::from_command_line(&argv)
        .ok_or_else(|| BunkerError::config("empty command line"))?;
    let binds = cli.binds();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install interrupt handler")?;

    tracing::debug!(rootfs = %ctx.rootfs().display(), binds = binds.len(), "forking container supervisor");
    let code = fork::fork_and_wait(move || run_container(ctx, &binds, process))?;

    if interrupted.load(Ordering::SeqCst) {
        tracing::info!(code, "interrupted");
    }
    Ok(code)
}

/// Child side of the outer fork.
fn run_container(ctx: Context, binds: &[BindRequest], process: Process) -> i32 {
    let mut container = Container::new(ctx).with_default_mounts();
    for bind in binds {
        container.add_bind(&bind.host, &bind.target, bind.read_only);
    }
    container.add_process(process);

    match container.run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, state = %container.state(), "container failed");
            EXIT_FAILURE
        }
    }
}
