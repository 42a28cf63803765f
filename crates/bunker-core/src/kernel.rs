//! The syscall seam.
//!
//! Every kernel-visible mutation the jail performs goes through [`Kernel`].
//! [`LinuxKernel`] forwards to `nix` and `std::fs`; tests substitute a
//! recording double so ordering and parameters can be asserted without root.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::libc::dev_t;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use bunker_common::error::Result;

use crate::fork;

/// Kernel operations used to build and tear down a jail.
///
/// Every call is fallible and mutates global state that does not roll back
/// on its own, so callers serialize them in the documented order.
pub trait Kernel {
    /// Detaches the calling process into the namespaces named by `flags`.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `unshare(2)`.
    fn unshare(&self, flags: CloneFlags) -> io::Result<()>;

    /// Attaches a filesystem at `target`.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `mount(2)`.
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> io::Result<()>;

    /// Detaches the filesystem mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `umount2(2)`.
    fn umount(&self, target: &Path) -> io::Result<()>;

    /// Returns whether any filesystem entry (including a dangling symlink)
    /// exists at `path`.
    fn entry_exists(&self, path: &Path) -> bool;

    /// Returns whether `path` is a directory, following symlinks.
    fn is_dir(&self, path: &Path) -> bool;

    /// Creates an empty regular file. Fails if anything exists at `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn create_file(&self, path: &Path) -> io::Result<()>;

    /// Creates a single directory. Parents are not created.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Removes a file, symlink, device node, or empty directory.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn remove_entry(&self, path: &Path) -> io::Result<()>;

    /// Creates `link` pointing at `original`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()>;

    /// Creates a device node.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `mknod(2)`.
    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: dev_t) -> io::Result<()>;

    /// Sets permission bits on `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Changes the root directory of the calling process.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `chroot(2)`.
    fn chroot(&self, path: &Path) -> io::Result<()>;

    /// Changes the working directory of the calling process.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `chdir(2)`.
    fn chdir(&self, path: &Path) -> io::Result<()>;

    /// Replaces the supplementary group list.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `setgroups(2)`.
    fn setgroups(&self, groups: &[Gid]) -> io::Result<()>;

    /// Sets the real, effective, and saved group ID.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `setgid(2)`.
    fn setgid(&self, gid: Gid) -> io::Result<()>;

    /// Sets the real, effective, and saved user ID.
    ///
    /// # Errors
    ///
    /// Returns the OS error reported by `setuid(2)`.
    fn setuid(&self, uid: Uid) -> io::Result<()>;

    /// Runs `init` in a forked child and returns its exit code.
    ///
    /// After an `unshare` with `CLONE_NEWPID` the child is PID 1 of the new
    /// namespace, and every process it forks lives there too.
    ///
    /// # Errors
    ///
    /// Returns [`bunker_common::error::BunkerError::Fork`] if the child
    /// cannot be forked.
    fn run_init(&self, init: &mut dyn FnMut() -> i32) -> Result<i32>;
}

/// [`Kernel`] backed by the running Linux kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxKernel;

impl Kernel for LinuxKernel {
    fn unshare(&self, flags: CloneFlags) -> io::Result<()> {
        nix::sched::unshare(flags).map_err(io::Error::from)
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> io::Result<()> {
        nix::mount::mount(source, target, fstype, flags, data).map_err(io::Error::from)
    }

    fn umount(&self, target: &Path) -> io::Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(io::Error::from)
    }

    fn entry_exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(drop)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    fn remove_entry(&self, path: &Path) -> io::Result<()> {
        let metadata = std::fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        }
    }

    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(original, link)
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: dev_t) -> io::Result<()> {
        nix::sys::stat::mknod(path, kind, perm, dev).map_err(io::Error::from)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn chroot(&self, path: &Path) -> io::Result<()> {
        nix::unistd::chroot(path).map_err(io::Error::from)
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        nix::unistd::chdir(path).map_err(io::Error::from)
    }

    fn setgroups(&self, groups: &[Gid]) -> io::Result<()> {
        nix::unistd::setgroups(groups).map_err(io::Error::from)
    }

    fn setgid(&self, gid: Gid) -> io::Result<()> {
        nix::unistd::setgid(gid).map_err(io::Error::from)
    }

    fn setuid(&self, uid: Uid) -> io::Result<()> {
        nix::unistd::setuid(uid).map_err(io::Error::from)
    }

    fn run_init(&self, init: &mut dyn FnMut() -> i32) -> Result<i32> {
        fork::fork_and_wait(|| init())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_kernel_filesystem_helpers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = LinuxKernel;

        let sub = dir.path().join("sub");
        assert!(!kernel.entry_exists(&sub));
        kernel.create_dir(&sub).unwrap();
        assert!(kernel.entry_exists(&sub));

        let link = dir.path().join("fd");
        kernel.symlink(Path::new("/proc/self/fd"), &link).unwrap();
        assert!(kernel.entry_exists(&link));
        assert!(kernel.symlink(Path::new("/proc/self/fd"), &link).is_err());

        kernel.remove_entry(&link).unwrap();
        kernel.remove_entry(&sub).unwrap();
        assert!(!kernel.entry_exists(&link));
        assert!(!kernel.entry_exists(&sub));
    }

    #[test]
    fn create_file_makes_an_empty_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("resolv.conf");
        LinuxKernel.create_file(&file).unwrap();
        assert!(!LinuxKernel.is_dir(&file));
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 0);
        assert!(LinuxKernel.create_file(&file).is_err());
        assert!(LinuxKernel.is_dir(dir.path()));
    }

    #[test]
    fn run_init_returns_the_child_exit_code() {
        let mut init = || 7;
        assert_eq!(LinuxKernel.run_init(&mut init).unwrap(), 7);
    }

    #[test]
    fn dangling_symlink_counts_as_existing() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("ptmx");
        LinuxKernel.symlink(Path::new("pts/ptmx"), &link).unwrap();
        assert!(LinuxKernel.entry_exists(&link));
    }

    #[test]
    fn chmod_sets_exact_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("null");
        std::fs::write(&file, b"").unwrap();
        LinuxKernel.chmod(&file, 0o666).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }
}
