//! The jail [`Context`]: the one configuration value every component reads.
//!
//! A `Context` is built once by the entry point, handed to the container by
//! value, and never mutated once the container starts running. Forked
//! children read their own copy-on-write snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_PATH, DEFAULT_WORK_DIR, EXPECTED_ROOT_ENTRIES, FAKEROOT_FALLBACK_DIR, NOBODY_UID,
};
use crate::error::{BunkerError, Result};

/// Which fakeroot implementation wraps the contained command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FakerootBinary {
    /// No shim, even if fakeroot is requested.
    None,
    /// The stock `fakeroot` binary.
    #[default]
    Default,
    /// The SysV IPC flavour, `fakeroot-sysv`.
    Sysv,
}

impl FakerootBinary {
    /// Executable name of this variant, or `None` for [`FakerootBinary::None`].
    #[must_use]
    pub const fn program_name(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Default => Some("fakeroot"),
            Self::Sysv => Some("fakeroot-sysv"),
        }
    }

    /// Path used when the binary cannot be found on the contained `PATH`.
    #[must_use]
    pub fn fallback_path(self) -> Option<PathBuf> {
        self.program_name()
            .map(|name| Path::new(FAKEROOT_FALLBACK_DIR).join(name))
    }
}

impl fmt::Display for FakerootBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Default => write!(f, "default"),
            Self::Sysv => write!(f, "sysv"),
        }
    }
}

/// Configuration of one jail run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Context {
    rootfs: PathBuf,
    uid: u32,
    work_dir: PathBuf,
    environment: BTreeMap<String, String>,
    fakeroot: bool,
    fakeroot_binary: FakerootBinary,
    networking: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            rootfs: PathBuf::new(),
            uid: NOBODY_UID,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            environment: BTreeMap::new(),
            fakeroot: false,
            fakeroot_binary: FakerootBinary::Default,
            networking: false,
        }
    }
}

impl Context {
    /// Creates a context for the given rootfs with every other field defaulted.
    #[must_use]
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            ..Self::default()
        }
    }

    /// Loads a context from a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid context.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| BunkerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let ctx: Self = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), rootfs = %ctx.rootfs.display(), "loaded context");
        Ok(ctx)
    }

    /// Replaces the rootfs.
    #[must_use]
    pub fn with_rootfs(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.rootfs = rootfs.into();
        self
    }

    /// Sets the uid (and gid) the contained command runs as.
    #[must_use]
    pub const fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Sets the working directory inside the jail.
    #[must_use]
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Sets one environment variable, replacing any previous value.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.environment.insert(key.into(), value.into());
        self
    }

    /// Enables the fakeroot shim with the given variant.
    #[must_use]
    pub const fn with_fakeroot(mut self, binary: FakerootBinary) -> Self {
        self.fakeroot = true;
        self.fakeroot_binary = binary;
        self
    }

    /// Keeps (`true`) or isolates (`false`) the host network and UTS namespaces.
    #[must_use]
    pub const fn with_networking(mut self, networking: bool) -> Self {
        self.networking = networking;
        self
    }

    /// Directory that becomes `/` for the contained command.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Uid the contained command runs as.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Working directory inside the jail.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Environment exactly as configured by the caller.
    #[must_use]
    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Whether fakeroot was requested.
    #[must_use]
    pub const fn fakeroot(&self) -> bool {
        self.fakeroot
    }

    /// Configured fakeroot variant.
    #[must_use]
    pub const fn fakeroot_binary(&self) -> FakerootBinary {
        self.fakeroot_binary
    }

    /// Whether the host network is shared with the jail.
    #[must_use]
    pub const fn networking(&self) -> bool {
        self.networking
    }

    /// The fakeroot variant to prefix, if fakeroot is requested and a
    /// variant other than [`FakerootBinary::None`] is configured.
    #[must_use]
    pub const fn fakeroot_prefix(&self) -> Option<FakerootBinary> {
        match (self.fakeroot, self.fakeroot_binary) {
            (true, FakerootBinary::Default | FakerootBinary::Sysv) => Some(self.fakeroot_binary),
            _ => None,
        }
    }

    /// Environment handed to the contained command: the configured mapping
    /// plus a default `PATH` when the caller did not set one.
    #[must_use]
    pub fn effective_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.environment.clone();
        let _ = env
            .entry("PATH".to_owned())
            .or_insert_with(|| DEFAULT_PATH.to_owned());
        env
    }

    /// Resolves an in-jail path against the rootfs.
    ///
    /// The join is lexical. `..` never climbs above the rootfs, so the
    /// result always lies inside it.
    #[must_use]
    pub fn join_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        let mut inside = PathBuf::new();
        for component in rel.as_ref().components() {
            match component {
                Component::Normal(part) => inside.push(part),
                Component::ParentDir => {
                    let _ = inside.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        self.rootfs.join(inside)
    }

    /// Checks the rootfs invariant: non-empty path to an existing directory.
    ///
    /// # Errors
    ///
    /// Returns [`BunkerError::Config`] if the rootfs is unset, missing, or
    /// not a directory.
    pub fn validate(&self) -> Result<()> {
        if self.rootfs.as_os_str().is_empty() {
            return Err(BunkerError::config("chroot directory is not set"));
        }
        if !self.rootfs.is_dir() {
            return Err(BunkerError::config(format!(
                "rootfs {} does not exist or is not a directory",
                self.rootfs.display()
            )));
        }
        Ok(())
    }

    /// Sanity check of the rootfs once mounts are up.
    ///
    /// Only reports; a malformed rootfs is not repaired.
    ///
    /// # Errors
    ///
    /// Returns [`BunkerError::Config`] naming every expected top-level entry
    /// that is missing.
    pub fn inspect_root(&self) -> Result<()> {
        let missing: Vec<&str> = EXPECTED_ROOT_ENTRIES
            .iter()
            .copied()
            .filter(|entry| std::fs::symlink_metadata(self.join_path(entry)).is_err())
            .collect();
        if missing.is_empty() {
            tracing::debug!(rootfs = %self.rootfs.display(), "rootfs looks sane");
            return Ok(());
        }
        Err(BunkerError::config(format!(
            "rootfs {} is missing: {}",
            self.rootfs.display(),
            missing.join(", ")
        )))
    }
}
