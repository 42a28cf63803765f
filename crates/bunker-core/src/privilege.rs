//! Chroot entry and identity dropping for least-privilege execution.
//!
//! Both run inside a freshly forked child. Once either has started there is
//! no safe way back to the parent's state, so callers treat every error from
//! this module as fatal for that child.

use std::path::Path;

use bunker_common::config::Context;
use bunker_common::error::{BunkerError, Result};
use nix::unistd::{Gid, Uid};

use crate::kernel::Kernel;

/// Changes the root to `rootfs` and moves the working directory inside it.
///
/// # Errors
///
/// Returns [`BunkerError::Chroot`] if either `chroot(2)` or the following
/// `chdir("/")` fails.
pub fn enter_chroot<K: Kernel + ?Sized>(kernel: &K, rootfs: &Path) -> Result<()> {
    let fail = |source| BunkerError::Chroot {
        path: rootfs.to_path_buf(),
        source,
    };
    kernel.chroot(rootfs).map_err(fail)?;
    kernel.chdir(Path::new("/")).map_err(fail)?;
    tracing::debug!(rootfs = %rootfs.display(), "entered chroot");
    Ok(())
}

/// Drops supplementary groups, then the group ID, then the user ID to `id`.
///
/// The order is load-bearing: once the user ID is unprivileged the kernel
/// refuses any further group change.
///
/// # Errors
///
/// Returns [`BunkerError::PrivilegeDrop`] naming the call that failed.
pub fn drop_privileges<K: Kernel + ?Sized>(kernel: &K, id: u32) -> Result<()> {
    let gid = Gid::from_raw(id);
    let fail = |step: &'static str| {
        move |source: std::io::Error| BunkerError::PrivilegeDrop { step, id, source }
    };
    kernel.setgroups(&[gid]).map_err(fail("setgroups"))?;
    kernel.setgid(gid).map_err(fail("setgid"))?;
    kernel.setuid(Uid::from_raw(id)).map_err(fail("setuid"))?;
    tracing::debug!(uid = id, gid = id, "privileges dropped");
    Ok(())
}

/// Enters the jail described by `ctx`: chroot first, then the identity drop.
///
/// # Errors
///
/// Returns [`BunkerError::Chroot`] or [`BunkerError::PrivilegeDrop`].
pub fn enter_jail<K: Kernel + ?Sized>(kernel: &K, ctx: &Context) -> Result<()> {
    enter_chroot(kernel, ctx.rootfs())?;
    drop_privileges(kernel, ctx.uid())
}
