//! Linux namespace detachment for jail isolation.
//!
//! The jail always gets a private mount table and PID space. Network and
//! UTS isolation are added unless the caller asked to keep host networking.

use bunker_common::error::{BunkerError, Result};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;

use crate::kernel::Kernel;

/// Which namespaces to detach into.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate the mount table.
    pub mount: bool,
    /// Isolate the PID space.
    pub pid: bool,
    /// Isolate the network stack.
    pub network: bool,
    /// Isolate hostname and domain name.
    pub uts: bool,
}

impl NamespaceConfig {
    /// Namespaces for a jail that does (`true`) or does not share host
    /// networking.
    #[must_use]
    pub const fn for_networking(networking: bool) -> Self {
        Self {
            mount: true,
            pid: true,
            network: !networking,
            uts: !networking,
        }
    }

    /// Clone flags passed to `unshare(2)`.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::for_networking(false)
    }
}

/// Detaches the calling process into the configured namespaces with a
/// single `unshare(2)`.
///
/// With a fresh mount namespace the root mount is then made recursively
/// private, so jail mounts never propagate back to the host.
///
/// Processes forked afterwards land in the new PID namespace; the caller
/// itself keeps its PID.
///
/// # Errors
///
/// Returns [`BunkerError::Namespace`] if `unshare(2)` fails and
/// [`BunkerError::Mount`] if the propagation change is refused.
pub fn detach<K: Kernel + ?Sized>(kernel: &K, config: &NamespaceConfig) -> Result<()> {
    let flags = config.clone_flags();
    tracing::info!(?flags, "detaching namespaces");
    kernel
        .unshare(flags)
        .map_err(|source| BunkerError::Namespace {
            flags: format!("{flags:?}"),
            source,
        })?;

    if config.mount {
        kernel
            .mount(
                None,
                std::path::Path::new("/"),
                None,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None,
            )
            .map_err(|source| BunkerError::Mount {
                target: "/".into(),
                source,
            })?;
    }
    tracing::debug!("namespaces detached");
    Ok(())
}
