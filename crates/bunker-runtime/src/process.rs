//! Privilege-dropped process execution inside the jail.
//!
//! Each [`Process`] forks a child that chroots into the rootfs, drops to the
//! configured uid, optionally prefixes a fakeroot shim, and runs the target
//! program with exactly the configured environment.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use bunker_common::config::Context;
use bunker_common::constants::{EXIT_CHILD_FATAL, EXIT_FAILURE, SIGNAL_EXIT_BASE};
use bunker_common::error::{BunkerError, Result};
use bunker_core::kernel::Kernel;
use bunker_core::{fork, privilege};

/// A program and its arguments, run once inside the jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    program: String,
    args: Vec<String>,
}

impl Process {
    /// Creates a process running `program` with `args`.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a command line into program and arguments. `None` when empty.
    #[must_use]
    pub fn from_command_line(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, not including the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Runs the process inside the jail described by `ctx` and returns its
    /// exit code.
    ///
    /// Spawn failures inside the child become exit code `1`. A child that
    /// cannot enter the jail exits with `125`.
    ///
    /// # Errors
    ///
    /// Returns [`BunkerError::Fork`] if the child cannot be forked.
    pub fn run<K: Kernel + ?Sized>(&self, kernel: &K, ctx: &Context) -> Result<i32> {
        tracing::info!(program = %self.program, args = ?self.args, "running process");
        let code = fork::fork_and_wait(|| self.child_main(kernel, ctx))?;
        tracing::info!(program = %self.program, code, "process exited");
        Ok(code)
    }

    fn child_main<K: Kernel + ?Sized>(&self, kernel: &K, ctx: &Context) -> i32 {
        match self.exec_in_jail(kernel, ctx) {
            Ok(code) => code,
            Err(e) if e.is_child_fatal() => {
                tracing::error!(error = %e, "cannot enter jail");
                EXIT_CHILD_FATAL
            }
            Err(e) => {
                tracing::error!(error = %e, "process failed to start");
                EXIT_FAILURE
            }
        }
    }

    fn exec_in_jail<K: Kernel + ?Sized>(&self, kernel: &K, ctx: &Context) -> Result<i32> {
        privilege::enter_jail(kernel, ctx)?;
        let env = ctx.effective_environment();
        let prefix = CommandPrefix::resolve(ctx, &env);
        spawn_and_wait(&prefix.argv(self), &env, ctx.work_dir())
    }
}

/// Optional command prepended to every process: empty, or the resolved
/// fakeroot binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPrefix(Option<PathBuf>);

impl CommandPrefix {
    /// A prefix running `binary` in front of the target program.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self(Some(binary.into()))
    }

    /// Resolves the prefix `ctx` asks for against the `PATH` in `env`,
    /// relative to the current root.
    ///
    /// Falls back to the variant's path under `/usr/bin` when the lookup
    /// fails, so a missing shim surfaces as a spawn failure.
    #[must_use]
    pub fn resolve(ctx: &Context, env: &BTreeMap<String, String>) -> Self {
        let Some(binary) = ctx.fakeroot_prefix() else {
            return Self::default();
        };
        let Some(name) = binary.program_name() else {
            return Self::default();
        };
        match which::which_in(name, env.get("PATH"), Path::new("/")) {
            Ok(path) => {
                tracing::debug!(variant = %binary, path = %path.display(), "fakeroot resolved");
                Self(Some(path))
            }
            Err(e) => {
                tracing::warn!(variant = %binary, error = %e, "fakeroot not on PATH, using fallback");
                Self(binary.fallback_path())
            }
        }
    }

    /// The prefix binary, if any.
    #[must_use]
    pub fn binary(&self) -> Option<&Path> {
        self.0.as_deref()
    }

    /// Full argument vector for `process`, prefix first.
    #[must_use]
    pub fn argv(&self, process: &Process) -> Vec<OsString> {
        self.0
            .iter()
            .map(|binary| binary.as_os_str().to_owned())
            .chain(std::iter::once(OsString::from(&process.program)))
            .chain(process.args.iter().map(OsString::from))
            .collect()
    }
}

/// Spawns `argv` with inherited standard streams, exactly `env`, and
/// `work_dir`, then waits for it.
fn spawn_and_wait(argv: &[OsString], env: &BTreeMap<String, String>, work_dir: &Path) -> Result<i32> {
    let Some((program, args)) = argv.split_first() else {
        return Err(BunkerError::config("empty command line"));
    };
    let status = Command::new(program)
        .args(args)
        .env_clear()
        .envs(env)
        .current_dir(work_dir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|source| BunkerError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;
    Ok(status
        .code()
        .or_else(|| status.signal().map(|signal| SIGNAL_EXIT_BASE + signal))
        .unwrap_or(EXIT_FAILURE))
}
