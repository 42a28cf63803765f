//! Mount points for jail filesystem setup.
//!
//! A [`MountPoint`] describes one filesystem to attach under the rootfs. A
//! [`MountStack`] brings a sequence of them up in order and guarantees they
//! come down in reverse order, including when setup aborts halfway.

use std::path::{Path, PathBuf};

use bunker_common::config::Context;
use bunker_common::error::{BunkerError, Result};
use nix::mount::MsFlags;

use crate::kernel::Kernel;

/// Mount options for the kernel pseudo-filesystems `/proc` and `/sys`.
const PSEUDO_FS_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_RELATIME);

/// Mount options for scratch tmpfs mounts.
const TMPFS_FLAGS: MsFlags = MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV);

/// Mount options for the pty filesystem.
const DEVPTS_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_RELATIME);

/// Private devpts instance whose `ptmx` is usable through `/dev/ptmx`.
const DEVPTS_DATA: &str = "newinstance,ptmxmode=0666,mode=0620";

/// One filesystem to attach inside the rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    fstype: Option<String>,
    source: Option<PathBuf>,
    flags: MsFlags,
    data: Option<String>,
    target: PathBuf,
}

impl MountPoint {
    /// A filesystem of type `fstype`, mounted from `source` at the in-jail
    /// path `target`.
    #[must_use]
    pub fn new(
        fstype: impl Into<String>,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        flags: MsFlags,
    ) -> Self {
        Self {
            fstype: Some(fstype.into()),
            source: Some(source.into()),
            flags,
            data: None,
            target: target.into(),
        }
    }

    /// A bind mount of the host path `host` at the in-jail path `target`.
    #[must_use]
    pub fn bind(host: impl Into<PathBuf>, target: impl Into<PathBuf>, read_only: bool) -> Self {
        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        Self {
            fstype: None,
            source: Some(host.into()),
            flags,
            data: None,
            target: target.into(),
        }
    }

    /// Adds filesystem-specific mount data.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Filesystem type, `None` for bind mounts.
    #[must_use]
    pub fn fstype(&self) -> Option<&str> {
        self.fstype.as_deref()
    }

    /// Mount source.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Mount flags.
    #[must_use]
    pub const fn flags(&self) -> MsFlags {
        self.flags
    }

    /// Filesystem-specific mount data.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Target relative to the rootfs.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Whether this is a bind mount.
    #[must_use]
    pub const fn is_bind(&self) -> bool {
        self.flags.contains(MsFlags::MS_BIND)
    }

    /// Whether the mount ends up read-only.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.flags.contains(MsFlags::MS_RDONLY)
    }

    /// Attaches the filesystem at the target resolved against the rootfs.
    ///
    /// The leaf mount point is created when missing: an empty file for a
    /// bind of a non-directory, a directory otherwise. Parents are not. The
    /// kernel ignores `MS_RDONLY` on a fresh bind, so read-only binds get a
    /// second remount pass.
    ///
    /// # Errors
    ///
    /// Returns [`BunkerError::Mount`] if the mount point cannot be created or
    /// the kernel refuses the mount.
    pub fn up<K: Kernel + ?Sized>(&self, kernel: &K, ctx: &Context) -> Result<()> {
        let target = ctx.join_path(&self.target);
        let fail = |source| BunkerError::Mount {
            target: target.clone(),
            source,
        };

        if !kernel.entry_exists(&target) {
            match self.source.as_deref() {
                Some(host) if self.is_bind() && !kernel.is_dir(host) => {
                    kernel.create_file(&target).map_err(fail)?;
                }
                _ => kernel.create_dir(&target).map_err(fail)?,
            }
        }

        kernel
            .mount(
                self.source.as_deref(),
                &target,
                self.fstype.as_deref(),
                self.flags,
                self.data.as_deref(),
            )
            .map_err(fail)?;

        if self.is_bind() && self.is_read_only() {
            let remount = MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | (self.flags & (MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC));
            kernel
                .mount(None, &target, None, remount, None)
                .map_err(fail)?;
        }

        tracing::debug!(
            target = %target.display(),
            fstype = self.fstype.as_deref().unwrap_or("bind"),
            "mounted"
        );
        Ok(())
    }

    /// Detaches the filesystem from the target resolved against the rootfs.
    ///
    /// # Errors
    ///
    /// Returns [`BunkerError::Unmount`] if the kernel refuses.
    pub fn down<K: Kernel + ?Sized>(&self, kernel: &K, ctx: &Context) -> Result<()> {
        let target = ctx.join_path(&self.target);
        kernel
            .umount(&target)
            .map_err(|source| BunkerError::Unmount {
                target: target.clone(),
                source,
            })?;
        tracing::debug!(target = %target.display(), "unmounted");
        Ok(())
    }
}

/// The default mount set, in bring-up order: `/proc`, `/sys`, `/tmp`,
/// `/dev/shm`, `/dev/pts`.
#[must_use]
pub fn default_mounts() -> Vec<MountPoint> {
    vec![
        MountPoint::new("proc", "proc", "/proc", PSEUDO_FS_FLAGS),
        MountPoint::new("sysfs", "sysfs", "/sys", PSEUDO_FS_FLAGS),
        MountPoint::new("tmpfs", "tmpfs", "/tmp", TMPFS_FLAGS),
        MountPoint::new("tmpfs", "tmpfs", "/dev/shm", TMPFS_FLAGS),
        MountPoint::new("devpts", "devpts", "/dev/pts", DEVPTS_FLAGS).with_data(DEVPTS_DATA),
    ]
}

/// Scoped record of mounted entries.
///
/// Entries come down in reverse bring-up order, either through
/// [`MountStack::teardown`] or, if the stack is dropped first, on drop.
#[derive(Debug)]
pub struct MountStack<'a, K: Kernel + ?Sized> {
    kernel: &'a K,
    ctx: &'a Context,
    mounted: Vec<MountPoint>,
}

impl<'a, K: Kernel + ?Sized> MountStack<'a, K> {
    /// Creates an empty stack for the given rootfs.
    #[must_use]
    pub const fn new(kernel: &'a K, ctx: &'a Context) -> Self {
        Self {
            kernel,
            ctx,
            mounted: Vec::new(),
        }
    }

    /// Brings up `points` in order, stopping at the first failure.
    ///
    /// Entries mounted before the failure stay on the stack.
    ///
    /// # Errors
    ///
    /// Returns the first [`BunkerError::Mount`].
    pub fn mount_all<'p>(&mut self, points: impl IntoIterator<Item = &'p MountPoint>) -> Result<()> {
        for point in points {
            point.up(self.kernel, self.ctx)?;
            self.mounted.push(point.clone());
        }
        tracing::info!(count = self.mounted.len(), "mounts up");
        Ok(())
    }

    /// Entries currently mounted, in bring-up order.
    #[must_use]
    pub fn mounted(&self) -> &[MountPoint] {
        &self.mounted
    }

    /// Unmounts every entry in reverse bring-up order.
    ///
    /// Failures are logged and collected; they never stop the remaining
    /// unmounts.
    pub fn teardown(mut self) -> Vec<BunkerError> {
        let failures = self.unmount_all();
        tracing::info!(failures = failures.len(), "mounts down");
        failures
    }

    fn unmount_all(&mut self) -> Vec<BunkerError> {
        let mut failures = Vec::new();
        while let Some(point) = self.mounted.pop() {
            if let Err(e) = point.down(self.kernel, self.ctx) {
                tracing::warn!(error = %e, "unmount failed, continuing");
                failures.push(e);
            }
        }
        failures
    }
}

impl<K: Kernel + ?Sized> Drop for MountStack<'_, K> {
    fn drop(&mut self) {
        if !self.mounted.is_empty() {
            tracing::warn!(count = self.mounted.len(), "rolling back mounts after aborted setup");
            let _ = self.unmount_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::testing::{Call, RecordingKernel};

    fn jail() -> Context {
        Context::new("/jail")
    }

    #[test]
    fn default_mounts_follow_documented_order_and_flags() {
        let mounts = default_mounts();
        let summary: Vec<_> = mounts
            .iter()
            .map(|m| (m.fstype().unwrap(), m.target().to_str().unwrap()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("proc", "/proc"),
                ("sysfs", "/sys"),
                ("tmpfs", "/tmp"),
                ("tmpfs", "/dev/shm"),
                ("devpts", "/dev/pts"),
            ]
        );

        let pseudo = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;
        assert_eq!(mounts[0].flags(), pseudo);
        assert_eq!(mounts[1].flags(), pseudo);
        assert_eq!(mounts[2].flags(), MsFlags::MS_NOSUID | MsFlags::MS_NODEV);
        assert_eq!(mounts[3].flags(), MsFlags::MS_NOSUID | MsFlags::MS_NODEV);
        assert_eq!(
            mounts[4].flags(),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME
        );
    }

    #[test]
    fn bind_keeps_read_only_distinction() {
        let ro = MountPoint::bind("/host/a", "/mnt/a", true);
        let rw = MountPoint::bind("/host/b", "/mnt/b", false);
        assert!(ro.is_bind() && ro.is_read_only());
        assert!(rw.is_bind() && !rw.is_read_only());
        assert_eq!(ro.fstype(), None);
        assert_eq!(ro.source(), Some(Path::new("/host/a")));
    }

    #[test]
    fn up_resolves_target_and_creates_missing_leaf() {
        let kernel = RecordingKernel::new();
        default_mounts()[0].up(&kernel, &jail()).unwrap();

        let calls = kernel.calls();
        assert_eq!(calls[0], Call::CreateDir("/jail/proc".into()));
        assert_eq!(
            calls[1],
            Call::Mount {
                source: Some("proc".into()),
                target: "/jail/proc".into(),
                fstype: Some("proc".into()),
                flags: PSEUDO_FS_FLAGS,
                data: None,
            }
        );
    }

    #[test]
    fn up_leaves_existing_mount_point_alone() {
        let kernel = RecordingKernel::new().with_existing("/jail/tmp");
        default_mounts()[2].up(&kernel, &jail()).unwrap();
        assert!(!kernel.calls().iter().any(|c| matches!(c, Call::CreateDir(_))));
    }

    #[test]
    fn file_bind_gets_a_file_mount_point() {
        let kernel = RecordingKernel::new().with_host_file("/etc/resolv.conf");
        MountPoint::bind("/etc/resolv.conf", "/etc/resolv.conf", true)
            .up(&kernel, &jail())
            .unwrap();

        let calls = kernel.calls();
        assert_eq!(calls[0], Call::CreateFile("/jail/etc/resolv.conf".into()));
        assert!(!calls.iter().any(|c| matches!(c, Call::CreateDir(_))));
    }

    #[test]
    fn read_only_bind_is_remounted() {
        let kernel = RecordingKernel::new().with_existing("/jail/mnt/a");
        MountPoint::bind("/host/a", "/mnt/a", true)
            .up(&kernel, &jail())
            .unwrap();

        let calls = kernel.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            &calls[1],
            Call::Mount { source: None, flags, .. }
                if *flags == MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY
        ));
    }

    #[test]
    fn read_write_bind_mounts_once() {
        let kernel = RecordingKernel::new().with_existing("/jail/mnt/b");
        MountPoint::bind("/host/b", "/mnt/b", false)
            .up(&kernel, &jail())
            .unwrap();
        assert_eq!(kernel.calls().len(), 1);
    }

    #[test]
    fn mount_failure_is_reported_with_absolute_target() {
        let kernel = RecordingKernel::new().failing_mount("/jail/sys");
        let err = default_mounts()[1].up(&kernel, &jail()).unwrap_err();
        assert!(matches!(err, BunkerError::Mount { ref target, .. } if target == Path::new("/jail/sys")));
    }

    #[test]
    fn mount_all_stops_at_first_failure_and_drop_rolls_back() {
        let kernel = RecordingKernel::new().failing_mount("/jail/tmp");
        let ctx = jail();
        let mounts = default_mounts();
        {
            let mut stack = MountStack::new(&kernel, &ctx);
            assert!(stack.mount_all(&mounts).is_err());
            assert_eq!(stack.mounted().len(), 2);
        }
        assert_eq!(
            kernel.mount_targets(),
            vec![
                PathBuf::from("/jail/proc"),
                PathBuf::from("/jail/sys"),
                PathBuf::from("/jail/tmp"),
            ]
        );
        assert_eq!(
            kernel.umount_targets(),
            vec![PathBuf::from("/jail/sys"), PathBuf::from("/jail/proc")]
        );
    }

    #[test]
    fn teardown_continues_past_unmount_failures() {
        let kernel = RecordingKernel::new().failing_umount("/jail/tmp");
        let ctx = jail();
        let mounts = default_mounts();
        let mut stack = MountStack::new(&kernel, &ctx);
        stack.mount_all(&mounts).unwrap();

        let failures = stack.teardown();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], BunkerError::Unmount { .. }));
        assert_eq!(kernel.umount_targets().len(), 5);
    }

    proptest! {
        #[test]
        fn teardown_is_reverse_of_bring_up(names in proptest::collection::vec("[a-z]{1,8}", 0..16)) {
            let kernel = RecordingKernel::new();
            let ctx = jail();
            let mounts: Vec<_> = names
                .iter()
                .enumerate()
                .map(|(i, name)| MountPoint::new("tmpfs", "tmpfs", format!("/{i}-{name}"), TMPFS_FLAGS))
                .collect();

            let mut stack = MountStack::new(&kernel, &ctx);
            stack.mount_all(&mounts).unwrap();
            prop_assert!(stack.teardown().is_empty());

            let mut downs = kernel.umount_targets();
            downs.reverse();
            prop_assert_eq!(kernel.mount_targets(), downs);
            prop_assert_eq!(kernel.mount_targets().len(), names.len());
        }
    }
}
