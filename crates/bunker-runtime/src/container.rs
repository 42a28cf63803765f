//! Container orchestration.
//!
//! A [`Container`] owns the jail's [`Context`], the kernel it talks to, and
//! two append-only sequences: mount points in bring-up order and processes
//! in execution order. [`Container::run`] walks the lifecycle once.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use bunker_common::config::Context;
use bunker_common::constants::EXIT_FAILURE;
use bunker_common::error::{BunkerError, Result};
use bunker_common::types::ContainerState;
use bunker_core::filesystem::devices;
use bunker_core::filesystem::mount::{self, MountPoint, MountStack};
use bunker_core::kernel::{Kernel, LinuxKernel};
use bunker_core::namespace::{self, NamespaceConfig};
use nix::fcntl::OFlag;

use crate::process::Process;

/// A jail: its context, mount points, and processes.
#[derive(Debug)]
pub struct Container<K: Kernel = LinuxKernel> {
    ctx: Context,
    kernel: K,
    mounts: Vec<MountPoint>,
    processes: Vec<Process>,
    state: Cell<ContainerState>,
}

impl Container<LinuxKernel> {
    /// Creates a container backed by the real kernel.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self::with_kernel(ctx, LinuxKernel)
    }
}

impl<K: Kernel> Container<K> {
    /// Creates a container issuing its system calls through `kernel`.
    #[must_use]
    pub fn with_kernel(ctx: Context, kernel: K) -> Self {
        Self {
            ctx,
            kernel,
            mounts: Vec::new(),
            processes: Vec::new(),
            state: Cell::new(ContainerState::Created),
        }
    }

    /// Registers the five default pseudo filesystems ahead of any other
    /// mount point.
    #[must_use]
    pub fn with_default_mounts(mut self) -> Self {
        let mut mounts = mount::default_mounts();
        mounts.append(&mut self.mounts);
        self.mounts = mounts;
        self
    }

    /// Appends a mount point.
    pub fn add_mount(&mut self, point: MountPoint) {
        self.mounts.push(point);
    }

    /// Appends a bind mount of `host` at the in-jail path `target`.
    pub fn add_bind(&mut self, host: impl Into<PathBuf>, target: impl Into<PathBuf>, read_only: bool) {
        self.add_mount(MountPoint::bind(host, target, read_only));
    }

    /// Appends a process.
    pub fn add_process(&mut self, process: Process) {
        self.processes.push(process);
    }

    /// The jail's context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    /// The kernel this container talks to.
    #[must_use]
    pub const fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Registered mount points, in bring-up order.
    #[must_use]
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Registered processes, in execution order.
    #[must_use]
    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    /// Last lifecycle state reached.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state.get()
    }

    /// Runs the whole lifecycle and returns the last process's exit code,
    /// or `0` when no process is registered.
    ///
    /// Must be called from a process that may freely change its own
    /// namespaces: the caller is expected to have forked away from the
    /// supervising process first. After detaching, everything else runs in
    /// one forked init process, PID 1 of the new PID namespace, so `/proc`
    /// shows the jail's processes and every registered process can fork.
    ///
    /// # Errors
    ///
    /// - [`BunkerError::Config`] if the container already ran or the rootfs
    ///   is unset or not a directory. No kernel call is made in that case.
    /// - [`BunkerError::Namespace`] or [`BunkerError::Mount`] from namespace
    ///   detachment.
    /// - [`BunkerError::Fork`] or [`BunkerError::Progress`] if the init
    ///   process cannot be started or observed.
    /// - [`BunkerError::Supervisor`] if the init process stopped before the
    ///   mounts came down. When the kernel runs it inline, the typed
    ///   [`BunkerError::Mount`], [`BunkerError::Devfs`] or
    ///   [`BunkerError::Fork`] is returned instead.
    pub fn run(&self) -> Result<i32> {
        if self.state() != ContainerState::Created {
            return Err(BunkerError::config(format!(
                "container already ran (state: {})",
                self.state()
            )));
        }
        self.ctx.validate()?;
        tracing::info!(
            rootfs = %self.ctx.rootfs().display(),
            uid = self.ctx.uid(),
            mounts = self.mounts.len(),
            processes = self.processes.len(),
            "starting container"
        );

        namespace::detach(&self.kernel, &NamespaceConfig::for_networking(self.ctx.networking()))?;
        self.advance(ContainerState::NamespaceDetached);

        let (mut reader, writer) = progress_channel()?;
        let failure = RefCell::new(None);
        let mut init = || match self.supervise(&writer) {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(error = %e, state = %self.state(), "container run aborted");
                report(&writer, FAILED);
                *failure.borrow_mut() = Some(e);
                EXIT_FAILURE
            }
        };
        let code = self.kernel.run_init(&mut init)?;
        drop(writer);

        let mut progress = Vec::new();
        let _ = reader
            .read_to_end(&mut progress)
            .map_err(|source| BunkerError::Progress { source })?;
        let reached = progress
            .iter()
            .filter_map(|byte| ContainerState::from_byte(*byte))
            .max()
            .unwrap_or_else(|| self.state());
        if reached != self.state() {
            self.advance(reached);
        }
        if progress.contains(&FAILED) || reached != ContainerState::MountsDown {
            return Err(failure
                .into_inner()
                .unwrap_or(BunkerError::Supervisor { state: reached, code }));
        }

        self.advance(ContainerState::Finished);
        tracing::info!(code, "container finished");
        Ok(code)
    }

    /// Body of the init process: mounts, devfs, inspection, processes, and
    /// teardown. Each reached state is written to `progress`.
    fn supervise(&self, progress: &File) -> Result<i32> {
        let mut stack = MountStack::new(&self.kernel, &self.ctx);
        stack.mount_all(&self.mounts)?;
        self.reach(ContainerState::MountsUp, progress);

        devices::configure_devfs(&self.kernel, &self.ctx)?;
        self.reach(ContainerState::DevfsConfigured, progress);

        if let Err(e) = self.ctx.inspect_root() {
            tracing::warn!(error = %e, "rootfs looks incomplete, continuing");
        }
        self.reach(ContainerState::RootInspected, progress);

        let code = self.run_processes()?;
        self.reach(ContainerState::ProcessesExecuted, progress);

        let failures = stack.teardown();
        if !failures.is_empty() {
            tracing::warn!(failures = failures.len(), "some mounts could not be torn down");
        }
        self.reach(ContainerState::MountsDown, progress);
        Ok(code)
    }

    fn run_processes(&self) -> Result<i32> {
        let mut last = 0;
        for (index, process) in self.processes.iter().enumerate() {
            if last != 0 {
                tracing::warn!(
                    index = index - 1,
                    code = last,
                    "earlier process exited non-zero, continuing"
                );
            }
            last = process.run(&self.kernel, &self.ctx)?;
        }
        Ok(last)
    }

    fn reach(&self, next: ContainerState, progress: &File) {
        self.advance(next);
        report(progress, next.as_byte());
    }

    fn advance(&self, next: ContainerState) {
        tracing::debug!(from = %self.state(), to = %next, "container state");
        self.state.set(next);
    }
}

/// Progress byte written by the init process when the run aborts.
const FAILED: u8 = u8::MAX;

/// Close-on-exec pipe carrying the init process's progress to its parent,
/// so jailed programs never hold the write end.
fn progress_channel() -> Result<(File, File)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| BunkerError::Progress { source: e.into() })?;
    Ok((File::from(read), File::from(write)))
}

fn report(progress: &File, byte: u8) {
    let mut sink = progress;
    if let Err(e) = sink.write_all(&[byte]) {
        tracing::warn!(error = %e, "progress report lost");
    }
}
