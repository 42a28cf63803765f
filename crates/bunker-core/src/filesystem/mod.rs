//! Filesystem management for jail isolation.
//!
//! Provides mount points with ordered bring-up and reverse teardown, and
//! `/dev` population inside the rootfs.

pub mod devices;
pub mod mount;
