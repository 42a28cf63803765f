//! Unified error types for the bunker workspace.
//!
//! Fatal and recoverable failures share one enum; the propagation policy
//! (abort the run, or absorb into a log line and an exit code) is decided by
//! the caller, not by the variant.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerState;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BunkerError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid or missing.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The caller lacks the privileges required to build a jail.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// `unshare(2)` refused to detach the requested namespaces.
    #[error("namespace detach failed ({flags}): {source}")]
    Namespace {
        /// Debug rendering of the requested clone flags.
        flags: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A mount syscall failed during bring-up.
    #[error("mount of {target} failed: {source}")]
    Mount {
        /// Absolute mount target.
        target: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// An unmount syscall failed during teardown.
    #[error("unmount of {target} failed: {source}")]
    Unmount {
        /// Absolute mount target.
        target: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A `/dev` symlink or device node could not be created.
    #[error("devfs setup failed at {path}: {source}")]
    Devfs {
        /// Path of the entry being created.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Entering the chroot failed inside the forked child.
    #[error("chroot into {path} failed: {source}")]
    Chroot {
        /// Directory that was to become the new root.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Dropping groups or user identity failed inside the forked child.
    #[error("privilege drop ({step} {id}) failed: {source}")]
    PrivilegeDrop {
        /// Credential call that failed (`setgroups`, `setgid`, `setuid`).
        step: &'static str,
        /// Target identifier.
        id: u32,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The target program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// `fork(2)` failed.
    #[error("fork failed: {source}")]
    Fork {
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// `waitpid(2)` failed with a non-transient error.
    #[error("waitpid on {pid} failed: {source}")]
    Wait {
        /// Process being waited for.
        pid: i32,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The PID-1 supervisor stopped before tearing the mounts down.
    #[error("container supervisor stopped at {state} with exit code {code}")]
    Supervisor {
        /// Last state the supervisor reported.
        state: ContainerState,
        /// Exit code of the supervisor.
        code: i32,
    },

    /// The supervisor's progress channel could not be set up or read.
    #[error("progress channel failed: {source}")]
    Progress {
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BunkerError {
    /// Shorthand for building a [`BunkerError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns whether this error happens after the point of no return in a
    /// forked child, where the only safe reaction is an immediate exit.
    #[must_use]
    pub const fn is_child_fatal(&self) -> bool {
        matches!(self, Self::Chroot { .. } | Self::PrivilegeDrop { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BunkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_shorthand_renders_message() {
        let err = BunkerError::config("chroot directory is not set");
        assert_eq!(
            err.to_string(),
            "invalid configuration: chroot directory is not set"
        );
    }

    #[test]
    fn chroot_and_privilege_errors_are_child_fatal() {
        let chroot = BunkerError::Chroot {
            path: "/jail".into(),
            source: std::io::Error::from_raw_os_error(1),
        };
        let drop = BunkerError::PrivilegeDrop {
            step: "setuid",
            id: 65534,
            source: std::io::Error::from_raw_os_error(1),
        };
        let spawn = BunkerError::Spawn {
            program: "/bin/true".into(),
            source: std::io::Error::from_raw_os_error(2),
        };
        assert!(chroot.is_child_fatal());
        assert!(drop.is_child_fatal());
        assert!(!spawn.is_child_fatal());
    }

    #[test]
    fn supervisor_error_names_state_and_code() {
        let err = BunkerError::Supervisor {
            state: ContainerState::MountsUp,
            code: 1,
        };
        assert_eq!(
            err.to_string(),
            "container supervisor stopped at mounts-up with exit code 1"
        );
    }
}
