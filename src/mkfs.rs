// Build an empty file system on a block device.
//
// Disk layout:
// [ boot block | super block | log | inode blocks |
//                                          free bit map | data blocks ]
//
// The raw pieces (superblock, metadata bitmap, the root dinode) are
// poked directly; the root's "." and ".." entries go through the
// mounted stack so they take the ordinary dirlink/transaction path.

use crate::disk::BlockDevice;
use crate::fs::{
    Dinode, FileSystem, SuperBlock, BPB, BSIZE, DINODE_SIZE, FSMAGIC, IPB, ROOTINO,
};
use crate::param::LOGSIZE;
use crate::stat::IType;
use core::mem::size_of;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Format `disk` as a file system of `size` blocks with room for
/// `ninodes` inodes, seed the root directory, and return it mounted.
pub fn format(disk: Arc<dyn BlockDevice>, size: u32, ninodes: u32) -> FileSystem {
    let nbitmap = size / BPB + 1;
    let ninodeblocks = ninodes / IPB as u32 + 1;
    let nlog = LOGSIZE as u32;

    // 2 = boot sector + superblock.
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta < size, "mkfs: disk too small for its own metadata");
    assert!(nmeta < BPB, "mkfs: metadata spills past the first bitmap block");

    let sb = SuperBlock {
        magic: FSMAGIC,
        size,
        nblocks: size - nmeta,
        ninodes,
        nlog,
        logstart: 2,
        inodestart: 2 + nlog,
        bmapstart: 2 + nlog + ninodeblocks,
    };

    log::info!(
        "mkfs: nmeta {} (boot, super, log {}, inode {}, bitmap {}) data {} total {}",
        nmeta,
        nlog,
        ninodeblocks,
        nbitmap,
        sb.nblocks,
        size
    );

    let zeroes = [0u8; BSIZE];
    for bno in 0..size {
        disk.write_block(bno, &zeroes);
    }

    let mut buf = [0u8; BSIZE];
    buf[..size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
    disk.write_block(1, &buf);

    // Everything up to the first data block is spoken for.
    let mut bmap = [0u8; BSIZE];
    for b in 0..nmeta as usize {
        bmap[b / 8] |= 1 << (b % 8);
    }
    disk.write_block(sb.bmapstart, &bmap);

    // The root inode: a directory with one link, empty for now.
    let mut dip = Dinode::new_zeroed();
    dip.itype = IType::Dir as i16;
    dip.nlink = 1;
    let mut ibuf = [0u8; BSIZE];
    let off = ROOTINO as usize % IPB * DINODE_SIZE;
    ibuf[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
    disk.write_block(sb.iblock(ROOTINO), &ibuf);

    let fs = FileSystem::mount(disk);
    fs.begin_op();
    let root = fs.root();
    let mut guard = root.lock(&fs);
    guard.dirlink(&fs, ".", ROOTINO).expect("mkfs: dot entry");
    guard.dirlink(&fs, "..", ROOTINO).expect("mkfs: dotdot entry");
    drop(guard);
    fs.iput(root);
    fs.end_op();
    fs
}
