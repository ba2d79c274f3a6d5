//! Resource core of a Minix V3 filesystem: inode and zone bitmaps, the
//! in-memory inode table and per-directory lookup/mutation ordering, with a
//! small mount table on top.

mod bitmap; // inode and zone allocation
mod blk_cch; // Cache for block devices
mod blk_dev;
mod common;
mod device;
mod dir;
mod error;
mod fs; // mount table, namespace operations
mod inode;
mod super_blk;
mod zone;

pub use bitmap::Allocator;
pub use blk_cch::{BlockCache, BlockKind, BufRef, Buffer, CachePolicy};
pub use blk_dev::{BlockDevice, FileDisk, MemDisk};
pub use common::*;
pub use device::Device;
pub use dir::{DirEntry, DirLock, Directory};
pub use error::{FsError, Result};
pub use fs::{FileSystem, FsConfig, MkfsOptions};
pub use inode::{DiskInode, Inode, InodeCache, InodeInner};
pub use super_blk::{Geometry, SuperBlock};
