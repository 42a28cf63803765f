//! System-wide constants and defaults.

/// `PATH` injected into the contained environment when the caller sets none.
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// Working directory inside the jail when none is configured.
pub const DEFAULT_WORK_DIR: &str = "/";

/// UID of the conventional unprivileged `nobody` account.
pub const NOBODY_UID: u32 = 65534;

/// Command run when the caller gives none: an interactive login shell.
pub const DEFAULT_COMMAND: [&str; 2] = ["/bin/sh", "-l"];

/// File-creation mask applied by the binary at startup.
pub const UMASK: u32 = 0o022;

/// Directory searched for fakeroot binaries when `PATH` lookup fails.
pub const FAKEROOT_FALLBACK_DIR: &str = "/usr/bin";

/// Exit code of a forked child that failed after the point of no return
/// (chroot or privilege drop), or panicked.
pub const EXIT_CHILD_FATAL: i32 = 125;

/// Exit code reported when the target program cannot be spawned, or when
/// configuration is rejected before the jail is entered.
pub const EXIT_FAILURE: i32 = 1;

/// Offset added to a signal number when a process is killed by a signal.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Top-level entries a usable rootfs is expected to contain once mounts are up.
pub const EXPECTED_ROOT_ENTRIES: [&str; 7] = ["bin", "dev", "etc", "proc", "sys", "tmp", "usr"];
