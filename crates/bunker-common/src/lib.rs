//! # bunker-common
//!
//! Shared types, error definitions, the jail [`config::Context`], and
//! constants used across the entire bunker workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and issues no system calls beyond reading the rootfs.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
