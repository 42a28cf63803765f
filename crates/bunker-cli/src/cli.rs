//! Command-line flags and their translation into a jail [`Context`].

use std::path::PathBuf;

use bunker_common::config::{Context, FakerootBinary};
use bunker_common::constants::DEFAULT_COMMAND;
use bunker_common::error::Result;
use clap::{ArgAction, Parser, ValueEnum};

/// Run a command inside a chroot jail with fresh namespaces.
#[derive(Parser, Debug)]
#[command(name = "bunker", version, about, long_about = None)]
pub struct Cli {
    /// Root filesystem of the jail. Required unless set by `--config`.
    #[arg(short = 'd', long = "directory", value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Working directory inside the jail [default: /].
    #[arg(short = 'w', long = "workdir", value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Wrap the command in fakeroot.
    #[arg(short = 'f', long)]
    pub fakeroot: bool,

    /// Fakeroot variant used with `--fakeroot` [default: default].
    #[arg(long, value_enum, value_name = "VARIANT")]
    pub fakeroot_binary: Option<FakerootVariant>,

    /// Keep the host network and UTS namespaces.
    #[arg(short = 'n', long = "network")]
    pub network: bool,

    /// Read-only bind mount of a host path into the jail.
    #[arg(long = "ro-bind", num_args = 2, value_names = ["HOST", "CONTAINER"], action = ArgAction::Append)]
    pub ro_bind: Vec<PathBuf>,

    /// Read-write bind mount of a host path into the jail.
    #[arg(long = "rw-bind", num_args = 2, value_names = ["HOST", "CONTAINER"], action = ArgAction::Append)]
    pub rw_bind: Vec<PathBuf>,

    /// Environment variable for the command.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// User and group id to drop to [default: 65534].
    #[arg(short = 'u', long = "uid", value_name = "UID")]
    pub uid: Option<u32>,

    /// JSON file holding a base context. Flags override its fields.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Command and arguments to run [default: /bin/sh -l].
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// `--fakeroot-binary` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FakerootVariant {
    /// `fakeroot`.
    Default,
    /// `fakeroot-sysv`.
    Sysv,
    /// No shim.
    None,
}

impl From<FakerootVariant> for FakerootBinary {
    fn from(variant: FakerootVariant) -> Self {
        match variant {
            FakerootVariant::Default => Self::Default,
            FakerootVariant::Sysv => Self::Sysv,
            FakerootVariant::None => Self::None,
        }
    }
}

/// A requested bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    /// Host path.
    pub host: PathBuf,
    /// In-jail path.
    pub target: PathBuf,
    /// Whether the bind is remounted read-only.
    pub read_only: bool,
}

impl Cli {
    /// Builds the jail context: the `--config` file (or defaults), then
    /// every flag that was given on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn context(&self) -> Result<Context> {
        let mut ctx = match &self.config {
            Some(path) => Context::from_json_file(path)?,
            None => Context::default(),
        };
        if let Some(dir) = &self.directory {
            ctx = ctx.with_rootfs(dir);
        }
        if let Some(dir) = &self.workdir {
            ctx = ctx.with_work_dir(dir);
        }
        if let Some(uid) = self.uid {
            ctx = ctx.with_uid(uid);
        }
        if self.network {
            ctx = ctx.with_networking(true);
        }
        if self.fakeroot || ctx.fakeroot() {
            let binary = self
                .fakeroot_binary
                .map_or(ctx.fakeroot_binary(), FakerootBinary::from);
            ctx = ctx.with_fakeroot(binary);
        } else if self.fakeroot_binary.is_some() {
            tracing::warn!("--fakeroot-binary has no effect without --fakeroot");
        }
        for (key, value) in &self.env {
            ctx = ctx.with_env(key, value);
        }
        Ok(ctx)
    }

    /// Bind mounts in registration order: read-only first, then read-write.
    #[must_use]
    pub fn binds(&self) -> Vec<BindRequest> {
        pairs(&self.ro_bind, true)
            .chain(pairs(&self.rw_bind, false))
            .collect()
    }

    /// The command line to run, or the login shell when none was given.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        if self.command.is_empty() {
            DEFAULT_COMMAND.iter().map(|s| (*s).to_owned()).collect()
        } else {
            self.command.clone()
        }
    }
}

fn pairs(flat: &[PathBuf], read_only: bool) -> impl Iterator<Item = BindRequest> + '_ {
    flat.chunks_exact(2).map(move |pair| BindRequest {
        host: pair[0].clone(),
        target: pair[1].clone(),
        read_only,
    })
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
