//! oxfs: the storage core of a small POSIX-flavored file system.
//!
//! A hierarchical file system on a single block device, built from five
//! layers: a bucketed buffer cache with LRU eviction, a write-ahead redo
//! log giving crash atomicity to multi-block operations, a bitmap block
//! allocator, an inode layer with direct/indirect/doubly-indirect block
//! maps, and directories with path resolution.
//!
//! Everything hangs off a [`FileSystem`] value mounted over a
//! [`BlockDevice`]. Operations that write the disk run inside a
//! transaction:
//!
//! ```
//! use oxfs::{mkfs, IType, MemDisk, Path};
//! use std::sync::Arc;
//!
//! let fs = mkfs::format(Arc::new(MemDisk::new(400)), 400, 64);
//! fs.begin_op();
//! let ip = fs.create(Path::new("/motd"), IType::File, 0, 0).unwrap();
//! fs.end_op();
//!
//! fs.write_at(&ip, b"hello", 0).unwrap();
//!
//! let mut out = [0u8; 5];
//! assert_eq!(fs.read_at(&ip, &mut out, 0), 5);
//! assert_eq!(&out, b"hello");
//!
//! fs.begin_op();
//! fs.iput(ip);
//! fs.end_op();
//! ```

pub mod bio;
pub mod disk;
pub mod fs;
pub mod fslog;
pub mod mkfs;
pub mod param;
pub mod sleeplock;
pub mod stat;
pub mod sync;

pub use crate::disk::{BlockDevice, FileDisk, MemDisk};
pub use crate::fs::{
    Error, FileSystem, Inode, Path, Result, BSIZE, DIRSIZ, MAXFILE, NDIRECT, NINDIRECT, ROOTINO,
};
pub use crate::stat::{IType, Stat};
