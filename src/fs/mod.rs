//! Filesystem abstraction layer
//!
//! Provides the on-disk, block-oriented filesystem used for the root
//! volume. Call [`ext2::init_root_fs`] with a mounted block device during
//! kernel bringup before issuing any filesystem operation.

pub mod ext2;
