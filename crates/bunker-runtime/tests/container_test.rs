//! Container lifecycle tests against the recording kernel.
//!
//! Processes really fork and run host binaries: the recorded chroot is a
//! no-op, so `/bin/sh` resolves on the host.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use bunker_common::config::Context;
use bunker_common::error::BunkerError;
use bunker_common::types::ContainerState;
use bunker_core::testing::{Call, RecordingKernel};
use bunker_runtime::container::Container;
use bunker_runtime::process::Process;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;

fn container(ctx: Context) -> Container<RecordingKernel> {
    Container::with_kernel(ctx, RecordingKernel::new()).with_default_mounts()
}

// ── Exit codes ───────────────────────────────────────────────────────

#[test]
fn single_process_exit_code_is_returned() {
    let dir = tempfile::tempdir().unwrap();
    let mut container = container(Context::new(dir.path()));
    container.add_process(Process::new("/bin/sh", ["-c", "exit 42"]));

    assert_eq!(container.run().unwrap(), 42);
    assert_eq!(container.state(), ContainerState::Finished);
}

#[test]
fn unrunnable_fakeroot_yields_spawn_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    let bin = tempfile::tempdir().unwrap();
    // Found on PATH, but its interpreter does not exist, so exec fails.
    let shim = bin.path().join("fakeroot-sysv");
    std::fs::write(&shim, b"#!/nonexistent/bunker-interpreter\n").unwrap();
    std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();

    let ctx = Context::new(dir.path())
        .with_fakeroot(bunker_common::config::FakerootBinary::Sysv)
        .with_env("PATH", bin.path().to_str().unwrap());
    let mut container = container(ctx);
    container.add_process(Process::new("/bin/true", Vec::<String>::new()));

    assert_eq!(container.run().unwrap(), 1);
    assert_eq!(container.state(), ContainerState::Finished);
}

// ── Namespaces ───────────────────────────────────────────────────────

#[test]
fn isolated_run_unshares_network_and_uts() {
    let dir = tempfile::tempdir().unwrap();
    let container = container(Context::new(dir.path()));
    let _ = container.run().unwrap();

    let Call::Unshare(flags) = container.kernel().calls()[0] else {
        panic!("first call must be unshare");
    };
    assert!(flags.contains(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID));
    assert!(flags.contains(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS));
}

#[test]
fn networked_run_keeps_host_network() {
    let dir = tempfile::tempdir().unwrap();
    let container = container(Context::new(dir.path()).with_networking(true));
    let _ = container.run().unwrap();

    let Call::Unshare(flags) = container.kernel().calls()[0] else {
        panic!("first call must be unshare");
    };
    assert!(!flags.intersects(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS));
}

// ── Mounts ───────────────────────────────────────────────────────────

#[test]
fn bind_mounts_follow_defaults_and_tear_down_in_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let mut container = container(Context::new(dir.path()));
    container.add_bind("/srv/cache", "/var/cache", true);
    container.add_bind("/srv/work", "/work", false);
    let _ = container.run().unwrap();

    let kernel = container.kernel();
    let up: Vec<PathBuf> = kernel.mount_targets().into_iter().skip(1).collect();
    let expected: Vec<PathBuf> = ["proc", "sys", "tmp", "dev/shm", "dev/pts", "var/cache", "work"]
        .iter()
        .map(|p| dir.path().join(p))
        .collect();
    assert_eq!(up, expected);

    let mut down = kernel.umount_targets();
    down.reverse();
    assert_eq!(down, expected);

    let remounted = kernel.calls().into_iter().any(|call| {
        matches!(call, Call::Mount { target, flags, .. }
            if target == dir.path().join("var/cache")
                && flags.contains(MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY))
    });
    assert!(remounted);
}

#[test]
fn unmount_failure_does_not_change_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = RecordingKernel::new().failing_umount(dir.path().join("tmp"));
    let mut container = Container::with_kernel(Context::new(dir.path()), kernel).with_default_mounts();
    container.add_process(Process::new("/bin/sh", ["-c", "exit 7"]));

    assert_eq!(container.run().unwrap(), 7);
    assert_eq!(container.kernel().umount_targets().len(), 5);
    assert_eq!(container.state(), ContainerState::Finished);
}

// ── Preconditions ────────────────────────────────────────────────────

#[test]
fn unset_rootfs_makes_no_kernel_call() {
    let mut container = container(Context::default());
    container.add_process(Process::new("/bin/true", Vec::<String>::new()));

    let err = container.run().unwrap_err();
    assert!(matches!(err, BunkerError::Config { .. }));
    assert_eq!(err.to_string(), "invalid configuration: chroot directory is not set");
    assert!(container.kernel().calls().is_empty());
}
