//! # bunker-core
//!
//! Low-level Linux isolation primitives for the bunker jail.
//!
//! This crate provides:
//! - **Kernel**: the syscall seam every primitive goes through.
//! - **Fork**: the fork/wait protocol and exit-code mapping.
//! - **Namespaces**: clone-flag selection and `unshare(2)` detachment.
//! - **Filesystem**: mount points with ordered bring-up and teardown, and
//!   `/dev` population.
//! - **Privilege**: chroot entry and the group-then-user identity drop.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filesystem;
#[allow(unsafe_code)]
pub mod fork;
pub mod kernel;
pub mod namespace;
pub mod privilege;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
