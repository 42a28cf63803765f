//! Jail lifecycle management for the bunker runtime.
//!
//! [`container::Container`] drives the full setup, execute, and teardown
//! sequence from a forked init process. [`process::Process`] runs one
//! command inside the jail.

#![cfg_attr(test, allow(unsafe_code, clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod process;
