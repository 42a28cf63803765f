//! Domain primitive types used across the bunker workspace.

use std::fmt;

/// Lifecycle state of a container run.
///
/// States are totally ordered: each one is a precondition for the next. A
/// run that hits a fatal error stays at the last state it reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ContainerState {
    /// Built in memory; nothing touched yet.
    Created,
    /// Detached into fresh namespaces.
    NamespaceDetached,
    /// Every registered mount point is up.
    MountsUp,
    /// `/dev` symlinks and device nodes exist.
    DevfsConfigured,
    /// The rootfs sanity check ran.
    RootInspected,
    /// Every registered process ran to completion.
    ProcessesExecuted,
    /// Every mount point was torn down.
    MountsDown,
    /// The run is complete.
    Finished,
}

impl ContainerState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::Created,
        Self::NamespaceDetached,
        Self::MountsUp,
        Self::DevfsConfigured,
        Self::RootInspected,
        Self::ProcessesExecuted,
        Self::MountsDown,
        Self::Finished,
    ];

    /// One-byte encoding used to report progress across a fork.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decodes [`ContainerState::as_byte`]. `None` for unknown bytes.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(usize::from(byte)).copied()
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::NamespaceDetached => "namespace-detached",
            Self::MountsUp => "mounts-up",
            Self::DevfsConfigured => "devfs-configured",
            Self::RootInspected => "root-inspected",
            Self::ProcessesExecuted => "processes-executed",
            Self::MountsDown => "mounts-down",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}
