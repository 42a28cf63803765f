//! End-to-end runs against a real rootfs.
//!
//! Needs root and a populated rootfs named by `BUNKER_E2E_ROOTFS`; each test
//! passes trivially otherwise. Containers run in a forked child so the
//! namespace changes never reach the test harness.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::print_stderr)]

use std::path::{Path, PathBuf};

use bunker_common::config::Context;
use bunker_core::fork;
use bunker_runtime::container::Container;
use bunker_runtime::process::Process;

const LEFTOVER_MOUNT: i32 = 90;
const RUN_FAILED: i32 = 91;

fn e2e_rootfs() -> Option<PathBuf> {
    if !nix::unistd::geteuid().is_root() {
        return None;
    }
    std::env::var_os("BUNKER_E2E_ROOTFS").map(PathBuf::from)
}

fn sh(script: &str) -> Process {
    Process::new("/bin/sh", ["-c", script])
}

/// Runs a container built by `setup` in a forked child. Returns its exit
/// code, or one of the sentinel codes above.
fn run_forked(rootfs: &Path, setup: impl FnOnce(Context) -> Container) -> i32 {
    fork::fork_and_wait(|| {
        let container = setup(Context::new(rootfs));
        let Ok(code) = container.run() else {
            return RUN_FAILED;
        };

        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").unwrap_or_default();
        let leftover = container
            .mounts()
            .iter()
            .map(|m| container.context().join_path(m.target()))
            .any(|target| {
                let target = target.to_string_lossy();
                mountinfo
                    .lines()
                    .any(|line| line.split_whitespace().nth(4) == Some(target.as_ref()))
            });
        if leftover { LEFTOVER_MOUNT } else { code }
    })
    .unwrap()
}

#[test]
fn true_in_real_rootfs_exits_cleanly_and_unmounts() {
    let Some(rootfs) = e2e_rootfs() else {
        eprintln!("skipping: needs root and BUNKER_E2E_ROOTFS");
        return;
    };

    let code = run_forked(&rootfs, |ctx| {
        let mut container = Container::new(ctx).with_default_mounts();
        container.add_process(Process::new("/bin/true", Vec::<String>::new()));
        container
    });
    assert_eq!(code, 0);
}

#[test]
fn second_process_runs_and_its_code_is_returned() {
    let Some(rootfs) = e2e_rootfs() else {
        eprintln!("skipping: needs root and BUNKER_E2E_ROOTFS");
        return;
    };

    let code = run_forked(&rootfs, |ctx| {
        let mut container = Container::new(ctx).with_default_mounts();
        container.add_process(Process::new("/bin/true", Vec::<String>::new()));
        container.add_process(sh("exit 7"));
        container
    });
    assert_eq!(code, 7);
}

#[test]
fn proc_shows_the_jail_init_as_pid_one() {
    let Some(rootfs) = e2e_rootfs() else {
        eprintln!("skipping: needs root and BUNKER_E2E_ROOTFS");
        return;
    };

    // The init process is forked from the runner and inherits its name.
    let code = run_forked(&rootfs, |ctx| {
        let name = std::fs::read_to_string("/proc/self/comm").unwrap_or_default();
        let ctx = ctx.with_env("EXPECTED_INIT", name.trim_end());
        let mut container = Container::new(ctx).with_default_mounts();
        container.add_process(sh(
            r#"read init < /proc/1/comm; [ "$init" = "$EXPECTED_INIT" ] && [ "$$" -lt 10 ] && exit 42"#,
        ));
        container
    });
    assert_eq!(code, 42);
}
