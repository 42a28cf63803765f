//! Recording [`Kernel`] double.
//!
//! Keeps an in-memory view of which paths exist so that devfs idempotence
//! and mount-point creation behave like they would on disk, and records
//! every call in order. `run_init` runs its closure inline, so everything
//! the init process does lands in the same log.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc::dev_t;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};

use bunker_common::error::Result;

use crate::kernel::Kernel;

/// One recorded kernel call.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Unshare(CloneFlags),
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        fstype: Option<String>,
        flags: MsFlags,
        data: Option<String>,
    },
    Umount(PathBuf),
    CreateDir(PathBuf),
    CreateFile(PathBuf),
    RemoveEntry(PathBuf),
    Symlink { original: PathBuf, link: PathBuf },
    Mknod {
        path: PathBuf,
        kind: SFlag,
        perm: Mode,
        dev: dev_t,
    },
    Chmod { path: PathBuf, mode: u32 },
    Chroot(PathBuf),
    Chdir(PathBuf),
    SetGroups(Vec<Gid>),
    SetGid(Gid),
    SetUid(Uid),
    RunInit,
}

/// A [`Kernel`] that records calls instead of performing them.
#[derive(Debug, Default)]
pub struct RecordingKernel {
    calls: RefCell<Vec<Call>>,
    existing: RefCell<BTreeSet<PathBuf>>,
    host_files: RefCell<BTreeSet<PathBuf>>,
    failing_mounts: RefCell<BTreeSet<PathBuf>>,
    failing_umounts: RefCell<BTreeSet<PathBuf>>,
    fail_unshare: Cell<bool>,
    fail_chroot: Cell<bool>,
    uid_dropped: Cell<bool>,
}

impl RecordingKernel {
    /// Creates an empty recorder where no path exists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `path` as already present on the filesystem.
    #[must_use]
    pub fn with_existing(self, path: impl Into<PathBuf>) -> Self {
        let _ = self.existing.borrow_mut().insert(path.into());
        self
    }

    /// Marks `path` as a regular file for [`Kernel::is_dir`]. Every other
    /// path reads as a directory.
    #[must_use]
    pub fn with_host_file(self, path: impl Into<PathBuf>) -> Self {
        let _ = self.host_files.borrow_mut().insert(path.into());
        self
    }

    /// Makes every mount onto `target` fail with `EINVAL`.
    #[must_use]
    pub fn failing_mount(self, target: impl Into<PathBuf>) -> Self {
        let _ = self.failing_mounts.borrow_mut().insert(target.into());
        self
    }

    /// Makes every unmount of `target` fail with `EBUSY`.
    #[must_use]
    pub fn failing_umount(self, target: impl Into<PathBuf>) -> Self {
        let _ = self.failing_umounts.borrow_mut().insert(target.into());
        self
    }

    /// Makes `unshare` fail with `EPERM`.
    #[must_use]
    pub fn failing_unshare(self) -> Self {
        self.fail_unshare.set(true);
        self
    }

    /// Makes `chroot` fail with `ENOENT`.
    #[must_use]
    pub fn failing_chroot(self) -> Self {
        self.fail_chroot.set(true);
        self
    }

    /// Snapshot of every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// Targets of every successful or attempted mount, in call order.
    #[must_use]
    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Mount { target, flags, .. } if !flags.contains(MsFlags::MS_REMOUNT) => {
                    Some(target.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Targets of every unmount, in call order.
    #[must_use]
    pub fn umount_targets(&self) -> Vec<PathBuf> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Umount(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether the in-memory filesystem holds `path`.
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        self.existing.borrow().contains(path)
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn create(&self, path: &Path) -> io::Result<()> {
        if self.existing.borrow_mut().insert(path.to_path_buf()) {
            Ok(())
        } else {
            Err(Errno::EEXIST.into())
        }
    }
}

impl Kernel for RecordingKernel {
    fn unshare(&self, flags: CloneFlags) -> io::Result<()> {
        self.record(Call::Unshare(flags));
        if self.fail_unshare.get() {
            return Err(Errno::EPERM.into());
        }
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> io::Result<()> {
        self.record(Call::Mount {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_owned),
            flags,
            data: data.map(str::to_owned),
        });
        if self.failing_mounts.borrow().contains(target) {
            return Err(Errno::EINVAL.into());
        }
        Ok(())
    }

    fn umount(&self, target: &Path) -> io::Result<()> {
        self.record(Call::Umount(target.to_path_buf()));
        if self.failing_umounts.borrow().contains(target) {
            return Err(Errno::EBUSY.into());
        }
        Ok(())
    }

    fn entry_exists(&self, path: &Path) -> bool {
        self.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        !self.host_files.borrow().contains(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        self.record(Call::CreateFile(path.to_path_buf()));
        self.create(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.record(Call::CreateDir(path.to_path_buf()));
        self.create(path)
    }

    fn remove_entry(&self, path: &Path) -> io::Result<()> {
        self.record(Call::RemoveEntry(path.to_path_buf()));
        if self.existing.borrow_mut().remove(path) {
            Ok(())
        } else {
            Err(Errno::ENOENT.into())
        }
    }

    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        self.record(Call::Symlink {
            original: original.to_path_buf(),
            link: link.to_path_buf(),
        });
        self.create(link)
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, dev: dev_t) -> io::Result<()> {
        self.record(Call::Mknod {
            path: path.to_path_buf(),
            kind,
            perm,
            dev,
        });
        self.create(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.record(Call::Chmod {
            path: path.to_path_buf(),
            mode,
        });
        if self.exists(path) {
            Ok(())
        } else {
            Err(Errno::ENOENT.into())
        }
    }

    fn chroot(&self, path: &Path) -> io::Result<()> {
        self.record(Call::Chroot(path.to_path_buf()));
        if self.fail_chroot.get() {
            return Err(Errno::ENOENT.into());
        }
        Ok(())
    }

    fn chdir(&self, path: &Path) -> io::Result<()> {
        self.record(Call::Chdir(path.to_path_buf()));
        Ok(())
    }

    fn setgroups(&self, groups: &[Gid]) -> io::Result<()> {
        self.record(Call::SetGroups(groups.to_vec()));
        if self.uid_dropped.get() {
            return Err(Errno::EPERM.into());
        }
        Ok(())
    }

    // An unprivileged uid can no longer change its gid, like the real kernel.
    fn setgid(&self, gid: Gid) -> io::Result<()> {
        self.record(Call::SetGid(gid));
        if self.uid_dropped.get() {
            return Err(Errno::EPERM.into());
        }
        Ok(())
    }

    fn setuid(&self, uid: Uid) -> io::Result<()> {
        self.record(Call::SetUid(uid));
        if !uid.is_root() {
            self.uid_dropped.set(true);
        }
        Ok(())
    }

    fn run_init(&self, init: &mut dyn FnMut() -> i32) -> Result<i32> {
        self.record(Call::RunInit);
        Ok(init())
    }
}
