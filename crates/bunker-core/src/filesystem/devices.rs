//! `/dev` population inside the rootfs.
//!
//! Runs once after every mount is up: first the stream and ptmx symlinks,
//! then the fixed character devices. Both steps replace whatever already
//! sits at their path, so repeated runs over the same rootfs succeed.

use std::path::{Path, PathBuf};

use bunker_common::config::Context;
use bunker_common::error::{BunkerError, Result};
use nix::sys::stat::{Mode, SFlag, makedev};

use crate::kernel::Kernel;

/// Permission bits of every device node.
const DEVICE_MODE: u32 = 0o666;

/// `(original, link)` pairs created under `/dev`. `/dev/ptmx` relies on
/// `/dev/pts` already being mounted.
pub const DEV_SYMLINKS: [(&str, &str); 5] = [
    ("/proc/self/fd", "/dev/fd"),
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
    ("pts/ptmx", "/dev/ptmx"),
];

/// One device node to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    /// In-jail path of the node.
    pub path: &'static str,
    /// Node type.
    pub kind: SFlag,
    /// Permission bits.
    pub mode: u32,
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
}

impl DeviceNode {
    /// A character device with mode `0666`.
    #[must_use]
    pub const fn char_device(path: &'static str, major: u64, minor: u64) -> Self {
        Self {
            path,
            kind: SFlag::S_IFCHR,
            mode: DEVICE_MODE,
            major,
            minor,
        }
    }

    /// Creates the node at its path resolved against the rootfs, replacing
    /// any existing entry, then re-applies the mode so the umask cannot
    /// narrow it.
    ///
    /// # Errors
    ///
    /// Returns [`BunkerError::Devfs`] if any step fails.
    pub fn create<K: Kernel + ?Sized>(&self, kernel: &K, ctx: &Context) -> Result<()> {
        let path = ctx.join_path(self.path);
        replace_existing(kernel, &path)?;

        let perm = Mode::from_bits_truncate(self.mode);
        kernel
            .mknod(&path, self.kind, perm, makedev(self.major, self.minor))
            .map_err(|source| devfs_error(&path, source))?;
        kernel
            .chmod(&path, self.mode)
            .map_err(|source| devfs_error(&path, source))?;
        tracing::trace!(path = %path.display(), major = self.major, minor = self.minor, "device node created");
        Ok(())
    }
}

/// Device nodes every jail gets. The numbers are fixed by the kernel.
pub const DEVICE_NODES: [DeviceNode; 6] = [
    DeviceNode::char_device("/dev/null", 1, 3),
    DeviceNode::char_device("/dev/zero", 1, 5),
    DeviceNode::char_device("/dev/full", 1, 7),
    DeviceNode::char_device("/dev/random", 1, 8),
    DeviceNode::char_device("/dev/urandom", 1, 9),
    DeviceNode::char_device("/dev/tty", 5, 0),
];

/// Populates `/dev` inside the rootfs: symlinks first, then device nodes.
///
/// # Errors
///
/// Returns [`BunkerError::Devfs`] on the first failure.
pub fn configure_devfs<K: Kernel + ?Sized>(kernel: &K, ctx: &Context) -> Result<()> {
    for (original, link) in DEV_SYMLINKS {
        let link = ctx.join_path(link);
        replace_existing(kernel, &link)?;
        kernel
            .symlink(Path::new(original), &link)
            .map_err(|source| devfs_error(&link, source))?;
    }
    for node in &DEVICE_NODES {
        node.create(kernel, ctx)?;
    }
    tracing::info!(
        symlinks = DEV_SYMLINKS.len(),
        nodes = DEVICE_NODES.len(),
        "devfs configured"
    );
    Ok(())
}

fn replace_existing<K: Kernel + ?Sized>(kernel: &K, path: &Path) -> Result<()> {
    if kernel.entry_exists(path) {
        kernel
            .remove_entry(path)
            .map_err(|source| devfs_error(path, source))?;
    }
    Ok(())
}

fn devfs_error(path: &Path, source: std::io::Error) -> BunkerError {
    BunkerError::Devfs {
        path: PathBuf::from(path),
        source,
    }
}
