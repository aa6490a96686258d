// File system implementation. Five layers:
//   - Blocks: allocator for raw disk blocks.
//   - Log: crash recovery for multi-step updates (fslog.rs).
//   - Files: inode allocator, reading, writing, metadata.
//   - Directories: inodes with special contents (list of other inodes!).
//   - Names: paths like /usr/rtm/oxfs/fs.rs for convenient naming.
//
// This file contains the low-level file system manipulation routines
// plus the FileSystem value that owns the caches and the log and is
// threaded through every entry point.

use crate::bio::BCache;
use crate::disk::BlockDevice;
use crate::fslog::Log;
use crate::param::{MAXOPBLOCKS, NINODE, ROOTDEV};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::stat::{IType, Stat};
use crate::sync::SpinLock;
use array_macro::array;
use core::mem::size_of;
use static_assertions::const_assert;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

pub const ROOTINO: u32 = 1; // root i-number
pub const BSIZE: usize = 1024; // block size

pub const FSMAGIC: u32 = 0x10203040;

pub const NDIRECT: usize = 11;
pub const NINDIRECT: usize = BSIZE / size_of::<u32>();
pub const NDINDIRECT: usize = NINDIRECT * NINDIRECT;
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NDINDIRECT;

/// Inodes per block.
pub const IPB: usize = BSIZE / size_of::<Dinode>();

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

/// Max length of a directory entry name.
pub const DIRSIZ: usize = 14;

pub const DIRENT_SIZE: usize = size_of::<Dirent>();
pub const DINODE_SIZE: usize = size_of::<Dinode>();

const_assert!(BSIZE % DINODE_SIZE == 0);
const_assert!(BSIZE % DIRENT_SIZE == 0);

// On-disk integers are little-endian. The structs below are read and
// written as raw bytes, so the host byte order must match.
const_assert!(cfg!(target_endian = "little"));

/// Reportable failures. Broken invariants (double frees, log overflow,
/// a type-0 inode coming off disk) are panics, not errors: they mean the
/// disk or this crate is corrupt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("file too large")]
    FileTooLarge,
    #[error("offset past end of file")]
    InvalidOffset,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad path component")]
    InvalidPath,
}

pub type Result<T> = core::result::Result<T, Error>;

// Disk layout:
// [ boot block | super block | log | inode blocks |
//                                          free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file system. The
// super block describes the disk layout:
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct SuperBlock {
    pub magic: u32,      // Must be FSMAGIC
    pub size: u32,       // Size of file system image (blocks)
    pub nblocks: u32,    // Number of data blocks
    pub ninodes: u32,    // Number of inodes
    pub nlog: u32,       // Number of log blocks, header included
    pub logstart: u32,   // Block number of first log block
    pub inodestart: u32, // Block number of first inode block
    pub bmapstart: u32,  // Block number of first free map block
}

impl SuperBlock {
    fn read(cache: &BCache, dev: u32) -> Self {
        let bp = cache.read(dev, 1);
        let sb = SuperBlock::read_from(&bp[..size_of::<SuperBlock>()]).unwrap();
        assert_eq!(sb.magic, FSMAGIC, "invalid file system");
        sb
    }

    /// Block containing inode i.
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    /// Block of free map containing the bit for block b.
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

// On-disk inode structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    pub itype: i16,                 // File type; 0 means free
    pub major: i16,                 // Major device number (Device only)
    pub minor: i16,                 // Minor device number (Device only)
    pub nlink: i16,                 // Number of links to inode in file system
    pub size: u32,                  // Size of data (bytes)
    pub addrs: [u32; NDIRECT + 2],  // Direct, indirect, doubly-indirect
}

// Directory entries: a directory is a file containing a sequence of
// these. inum == 0 marks a free slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    /// Fill in the name, null-padded. Names of exactly DIRSIZ bytes get
    /// no terminator.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(DIRSIZ);
        self.name[..n].copy_from_slice(&bytes[..n]);
        for b in self.name[n..].iter_mut() {
            *b = 0;
        }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Directory-entry name comparison: only the first DIRSIZ bytes
/// participate, matching what a directory can store.
pub fn namecmp(s: &str, t: &str) -> bool {
    s.as_bytes().iter().take(DIRSIZ).eq(t.as_bytes().iter().take(DIRSIZ))
}

// Inodes.
//
// An inode describes a single unnamed file. The inode disk structure
// holds metadata: the file's type, its size, the number of links
// referring to it, and the list of blocks holding the file's content.
//
// The inodes are laid out sequentially on disk at sb.inodestart. Each
// inode has a number, indicating its position on the disk.
//
// The FileSystem keeps a table of in-use inodes in memory to provide a
// place for synchronizing access to inodes used by multiple threads.
// The in-memory inodes include book-keeping information that is not
// stored on disk: the reference count (the Arc strong count of the
// table entry) and `valid`.
//
// * Allocation: an inode is allocated if its type (on disk) is
//   non-zero. ialloc() allocates, and iput() frees if the reference and
//   link counts have fallen to zero.
//
// * Referencing in table: an entry is free when its slot is None. The
//   Arc count tracks the number of in-memory handles to the entry (open
//   files and current directories). iget() finds or creates an entry
//   and hands out a clone; iput() consumes one.
//
// * Valid: the information (type, size, &c) in a table entry is only
//   correct when `valid` is set. MInode::lock() reads the inode from
//   disk and sets `valid`; iput() clears it when the entry dies.
//
// * Locked: file system code may only examine and modify the
//   information in an inode and its content after locking it, which
//   here means holding the SleepLockGuard over its IData.
//
// Thus a typical sequence is:
//   let ip = fs.iget(dev, inum);
//   let mut guard = ip.lock(&fs);
//   ... examine and modify through guard ...
//   drop(guard);
//   fs.iput(ip);      // inside a transaction
//
// lock() is separate from iget() so that callers can keep a long-term
// reference to an inode (as for an open file) and only lock it for
// short periods (e.g., in read). The separation also helps avoid
// deadlock and races during pathname lookup.
//
// The itable spinlock protects slot allocation and identity; all
// other fields are protected by the per-inode sleep-lock.

pub struct Itable {
    inner: SpinLock<[Option<Arc<MInode>>; NINODE]>,
}

/// In-memory inode: stable identity plus the sleep-locked body.
pub struct MInode {
    dev: u32,
    inum: u32,
    data: SleepLock<IData>,
}

/// Everything the sleep-lock protects: the copy of the disk inode.
pub struct IData {
    dev: u32,
    inum: u32,
    valid: bool,
    itype: IType,
    major: i16,
    minor: i16,
    nlink: i16,
    size: u32,
    addrs: [u32; NDIRECT + 2],
}

/// A counted handle to an in-memory inode. Clone (or `dup`) to take an
/// extra reference; give handles back with `FileSystem::iput`, inside a
/// transaction, since dropping the last reference to an unlinked inode
/// frees its blocks on disk.
#[derive(Clone)]
pub struct Inode {
    ip: Arc<MInode>,
}

impl Inode {
    pub fn dup(&self) -> Inode {
        Inode {
            ip: Arc::clone(&self.ip),
        }
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("dev", &self.ip.dev)
            .field("inum", &self.ip.inum)
            .finish()
    }
}

impl core::ops::Deref for Inode {
    type Target = MInode;
    fn deref(&self) -> &MInode {
        &self.ip
    }
}

impl MInode {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            data: SleepLock::new(IData::new(dev, inum), "inode"),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// Lock the inode, reading its body from disk on first touch.
    pub fn lock(&self, fs: &FileSystem) -> SleepLockGuard<'_, IData> {
        let mut guard = self.data.lock();
        if !guard.valid {
            let bp = fs.cache.read(self.dev, fs.sb.iblock(self.inum));
            let off = (self.inum as usize % IPB) * DINODE_SIZE;
            let dip = Dinode::read_from(&bp[off..off + DINODE_SIZE]).unwrap();
            drop(bp);
            guard.itype = IType::from_raw(dip.itype);
            guard.major = dip.major;
            guard.minor = dip.minor;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs = dip.addrs;
            guard.valid = true;
            if guard.itype == IType::None {
                panic!("ilock: no type");
            }
        }
        guard
    }
}

impl Itable {
    fn new() -> Self {
        Self {
            inner: SpinLock::new(array![None; NINODE], "itable"),
        }
    }

    /// Find the inode with number inum on device dev and return a handle
    /// to the in-memory copy. Does not lock the inode and does not read
    /// it from disk.
    fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.inner.lock();

        let mut empty: Option<usize> = None;
        for (i, slot) in guard.iter().enumerate() {
            match slot {
                Some(ip) if ip.dev == dev && ip.inum == inum => {
                    return Inode {
                        ip: Arc::clone(ip),
                    };
                }
                None if empty.is_none() => {
                    empty = Some(i);
                }
                _ => (),
            }
        }

        // Recycle an empty slot.
        let empty = match empty {
            Some(i) => i,
            None => panic!("iget: no inodes"),
        };
        let ip = Arc::new(MInode::new(dev, inum));
        guard[empty] = Some(Arc::clone(&ip));
        Inode { ip }
    }
}

impl IData {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            valid: false,
            itype: IType::None,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 2],
        }
    }

    pub fn itype(&self) -> IType {
        self.itype
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn nlink(&self) -> i16 {
        self.nlink
    }

    pub fn major(&self) -> i16 {
        self.major
    }

    pub fn minor(&self) -> i16 {
        self.minor
    }

    /// Copy stat information out of the inode.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev,
            ino: self.inum,
            itype: self.itype,
            nlink: self.nlink,
            size: self.size as usize,
        }
    }

    /// Copy a modified in-memory inode to disk (through the log). Must be
    /// called after every change to a field that lives on disk, inside a
    /// transaction.
    pub fn update(&self, fs: &FileSystem) {
        let mut bp = fs.cache.read(self.dev, fs.sb.iblock(self.inum));
        let off = (self.inum as usize % IPB) * DINODE_SIZE;
        let mut dip = Dinode::read_from(&bp[off..off + DINODE_SIZE]).unwrap();
        dip.itype = self.itype as i16;
        dip.major = self.major;
        dip.minor = self.minor;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs = self.addrs;
        bp[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
        fs.log.write(bp);
    }

    // Inode content.
    //
    // The content (data) associated with each inode is stored in blocks
    // on the disk. The first NDIRECT block numbers are listed in
    // addrs[]; the next NINDIRECT are listed in the block addrs[NDIRECT];
    // the next NINDIRECT * NINDIRECT hang off the doubly-indirect block
    // at addrs[NDIRECT + 1].

    /// Return the disk block address of the bn'th block of this inode,
    /// allocating it (and any missing indirect blocks) on demand.
    fn bmap(&mut self, fs: &FileSystem, bn: u32) -> u32 {
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = fs.balloc();
                self.addrs[bn] = addr;
            }
            return addr;
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // Load the indirect block, allocating if necessary.
            let mut addr = self.addrs[NDIRECT];
            if addr == 0 {
                addr = fs.balloc();
                self.addrs[NDIRECT] = addr;
            }
            return fs.indirect_entry(addr, bn);
        }
        bn -= NINDIRECT;

        if bn < NDINDIRECT {
            let mut addr = self.addrs[NDIRECT + 1];
            if addr == 0 {
                addr = fs.balloc();
                self.addrs[NDIRECT + 1] = addr;
            }
            let mid = fs.indirect_entry(addr, bn / NINDIRECT);
            return fs.indirect_entry(mid, bn % NINDIRECT);
        }

        panic!("bmap: out of range");
    }

    /// Truncate inode (discard contents). Caller must hold the inode
    /// lock and an open transaction.
    pub fn trunc(&mut self, fs: &FileSystem) {
        for addr in self.addrs.iter_mut().take(NDIRECT) {
            if *addr > 0 {
                fs.bfree(*addr);
                *addr = 0;
            }
        }

        if self.addrs[NDIRECT] > 0 {
            fs.free_indirect(self.addrs[NDIRECT], 1);
            self.addrs[NDIRECT] = 0;
        }

        if self.addrs[NDIRECT + 1] > 0 {
            fs.free_indirect(self.addrs[NDIRECT + 1], 2);
            self.addrs[NDIRECT + 1] = 0;
        }

        self.size = 0;
        self.update(fs);
    }

    /// Read data from the inode into dst, starting at byte offset off.
    /// Returns the number of bytes read; 0 if off is past the end.
    /// Caller must hold the inode lock.
    pub fn read(&mut self, fs: &FileSystem, dst: &mut [u8], off: u32) -> usize {
        let mut off = off as usize;
        let mut n = dst.len();

        if off > self.size as usize {
            return 0;
        }
        if off + n > self.size as usize {
            n = self.size as usize - off;
        }

        let mut tot = 0;
        while tot < n {
            let addr = self.bmap(fs, (off / BSIZE) as u32);
            let bp = fs.cache.read(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE - off % BSIZE);
            dst[tot..tot + m].copy_from_slice(&bp[off % BSIZE..off % BSIZE + m]);
            tot += m;
            off += m;
        }
        tot
    }

    /// Write src into the inode at byte offset off, growing the file if
    /// needed. Caller must hold the inode lock and an open transaction
    /// large enough for the blocks touched.
    pub fn write(&mut self, fs: &FileSystem, src: &[u8], off: u32) -> Result<usize> {
        let mut off = off as usize;
        let n = src.len();

        if off > self.size as usize {
            return Err(Error::InvalidOffset);
        }
        if off + n > MAXFILE * BSIZE {
            return Err(Error::FileTooLarge);
        }

        let mut tot = 0;
        while tot < n {
            let addr = self.bmap(fs, (off / BSIZE) as u32);
            let mut bp = fs.cache.read(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE - off % BSIZE);
            bp[off % BSIZE..off % BSIZE + m].copy_from_slice(&src[tot..tot + m]);
            fs.log.write(bp);
            tot += m;
            off += m;
        }

        if off > self.size as usize {
            self.size = off as u32;
        }

        // Write the inode back even if the size didn't change, because
        // bmap may have added a new block to addrs.
        self.update(fs);

        Ok(tot)
    }

    // Directories.

    /// Look for a directory entry. If found, return a referenced inode
    /// for it and optionally the entry's byte offset.
    pub fn dirlookup(
        &mut self,
        fs: &FileSystem,
        name: &str,
        poff: Option<&mut u32>,
    ) -> Option<Inode> {
        assert_eq!(self.itype, IType::Dir, "dirlookup not DIR");

        // A name longer than DIRSIZ cannot be stored, so it can never
        // match; checking here keeps prefix collisions out of every
        // caller, not just the ones that validate.
        if name.len() > DIRSIZ {
            return None;
        }

        for off in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::new_zeroed();
            let n = self.read(fs, de.as_bytes_mut(), off);
            assert_eq!(n, DIRENT_SIZE, "dirlookup read");
            if de.inum == 0 {
                continue;
            }
            if namecmp(de.name(), name) {
                if let Some(poff) = poff {
                    *poff = off;
                }
                return Some(fs.iget(self.dev, de.inum as u32));
            }
        }
        None
    }

    /// Write a new directory entry (name, inum) into this directory.
    /// Caller must hold the lock and an open transaction.
    pub fn dirlink(&mut self, fs: &FileSystem, name: &str, inum: u32) -> Result<()> {
        if name.is_empty() || name.len() > DIRSIZ {
            return Err(Error::InvalidPath);
        }

        // Check that name is not present.
        if let Some(ip) = self.dirlookup(fs, name, None) {
            fs.iput(ip);
            return Err(Error::AlreadyExists);
        }

        // Look for an empty dirent; otherwise append.
        let mut off = self.size;
        for o in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::new_zeroed();
            self.read(fs, de.as_bytes_mut(), o);
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        let mut de = Dirent::new_zeroed();
        de.inum = inum as u16;
        de.set_name(name);
        let n = self.write(fs, de.as_bytes(), off)?;
        assert_eq!(n, DIRENT_SIZE, "dirlink write");
        Ok(())
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self, fs: &FileSystem) -> bool {
        for off in ((2 * DIRENT_SIZE as u32)..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::new_zeroed();
            let n = self.read(fs, de.as_bytes_mut(), off);
            assert_eq!(n, DIRENT_SIZE, "is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

// Paths.

/// A borrowed path, split into components on demand (akin to str).
#[repr(transparent)]
pub struct Path {
    inner: str,
}

impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl Path {
    pub fn new<S: AsRef<str> + ?Sized>(s: &S) -> &Path {
        unsafe { &*(s.as_ref() as *const str as *const Path) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    /// Split off the first path element. Returns the element and the
    /// remainder (which keeps its leading slashes, so emptiness of the
    /// raw remainder distinguishes "a" from "a/").
    ///
    /// Examples:
    ///   skip_elem("a/bb/c") = Some(("a", "bb/c"))
    ///   skip_elem("///a//bb") = Some(("a", "//bb"))
    ///   skip_elem("a") = Some(("a", ""))
    ///   skip_elem("") = skip_elem("////") = None
    fn skip_elem(&self) -> Option<(&str, &Path)> {
        let s = self.inner.trim_start_matches('/');
        if s.is_empty() {
            return None;
        }
        match s.find('/') {
            Some(i) => Some((&s[..i], Path::new(&s[i..]))),
            None => Some((s, Path::new(""))),
        }
    }
}

/// The file system proper: one device, one buffer cache, one log, one
/// inode table. Initialization order is cache, then log (which may
/// replay a committed transaction), then the table.
pub struct FileSystem {
    dev: u32,
    sb: SuperBlock,
    cache: BCache,
    log: Log,
    itable: Itable,
}

impl FileSystem {
    /// Mount the file system on `disk`, replaying the log if a crash
    /// left a committed transaction uninstalled. Panics if the
    /// superblock is not one of ours.
    pub fn mount(disk: Arc<dyn BlockDevice>) -> FileSystem {
        let cache = BCache::new(disk);
        let sb = SuperBlock::read(&cache, ROOTDEV);
        log::debug!(
            "mount: size {} data {} inodes {} log [{}, {}) bmap {}",
            sb.size,
            sb.nblocks,
            sb.ninodes,
            sb.logstart,
            sb.logstart + sb.nlog,
            sb.bmapstart,
        );
        let log = Log::new(ROOTDEV, &sb, &cache);
        FileSystem {
            dev: ROOTDEV,
            sb,
            cache,
            log,
            itable: Itable::new(),
        }
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Open a transaction. Every sequence of operations that writes the
    /// disk must run between begin_op and end_op.
    pub fn begin_op(&self) {
        self.log.begin_op();
    }

    /// Close a transaction; commits once no operation is outstanding.
    pub fn end_op(&self) {
        self.log.end_op(&self.cache);
    }

    // Blocks.

    /// Zero a block through the log.
    fn bzero(&self, bno: u32) {
        let mut bp = self.cache.read(self.dev, bno);
        bp.copy_from_slice(&[0; BSIZE]);
        self.log.write(bp);
    }

    /// Allocate a zeroed disk block. Panics when the disk is full.
    fn balloc(&self) -> u32 {
        let sb = &self.sb;
        let mut b = 0;
        while b < sb.size {
            let mut bp = self.cache.read(self.dev, sb.bblock(b));
            let mut bi = 0;
            while bi < BPB && b + bi < sb.size {
                let m = 1u8 << (bi % 8);
                if bp[(bi / 8) as usize] & m == 0 {
                    // Block is free: take it.
                    bp[(bi / 8) as usize] |= m;
                    self.log.write(bp);
                    self.bzero(b + bi);
                    log::trace!("balloc: block {}", b + bi);
                    return b + bi;
                }
                bi += 1;
            }
            b += BPB;
        }
        panic!("balloc: out of blocks");
    }

    /// Free a disk block. Panics on double free.
    fn bfree(&self, b: u32) {
        let mut bp = self.cache.read(self.dev, self.sb.bblock(b));
        let bi = b % BPB;
        let m = 1u8 << (bi % 8);
        if bp[(bi / 8) as usize] & m == 0 {
            panic!("freeing free block");
        }
        bp[(bi / 8) as usize] &= !m;
        self.log.write(bp);
    }

    /// Entry `idx` of the indirect block at `addr`, allocating the
    /// referenced block if it is missing.
    fn indirect_entry(&self, addr: u32, idx: usize) -> u32 {
        let mut bp = self.cache.read(self.dev, addr);
        let off = idx * size_of::<u32>();
        let entry = u32::from_le_bytes(bp[off..off + 4].try_into().unwrap());
        if entry != 0 {
            return entry;
        }
        let fresh = self.balloc();
        bp[off..off + 4].copy_from_slice(&fresh.to_le_bytes());
        self.log.write(bp);
        fresh
    }

    /// Free the tree rooted at the indirect block `addr`: everything it
    /// references (recursing `depth - 1` further levels), then `addr`
    /// itself.
    fn free_indirect(&self, addr: u32, depth: u32) {
        {
            let bp = self.cache.read(self.dev, addr);
            for idx in 0..NINDIRECT {
                let off = idx * size_of::<u32>();
                let a = u32::from_le_bytes(bp[off..off + 4].try_into().unwrap());
                if a > 0 {
                    if depth > 1 {
                        self.free_indirect(a, depth - 1);
                    } else {
                        self.bfree(a);
                    }
                }
            }
        }
        self.bfree(addr);
    }

    // Inodes.

    /// Allocate an inode on disk with the given type. Returns an
    /// unlocked but referenced handle. Must be called inside a
    /// transaction.
    pub fn ialloc(&self, itype: IType) -> Inode {
        assert_ne!(itype, IType::None, "ialloc: bad type");
        for inum in 1..self.sb.ninodes {
            let mut bp = self.cache.read(self.dev, self.sb.iblock(inum));
            let off = (inum as usize % IPB) * DINODE_SIZE;
            let dip = Dinode::read_from(&bp[off..off + DINODE_SIZE]).unwrap();
            if dip.itype == 0 {
                // A free inode: claim it.
                let mut dip = Dinode::new_zeroed();
                dip.itype = itype as i16;
                bp[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
                self.log.write(bp);
                log::trace!("ialloc: inum {} type {:?}", inum, itype);
                return self.iget(self.dev, inum);
            }
        }
        panic!("ialloc: no inodes");
    }

    /// Look up an in-memory inode handle by number; no disk I/O.
    pub fn iget(&self, dev: u32, inum: u32) -> Inode {
        self.itable.get(dev, inum)
    }

    /// A handle to the root directory.
    pub fn root(&self) -> Inode {
        self.iget(self.dev, ROOTINO)
    }

    /// Drop a reference to an in-memory inode. If that was the last
    /// reference and the inode has no links, free it (and its content)
    /// on disk; that is why every iput must run inside a transaction.
    pub fn iput(&self, inode: Inode) {
        let Inode { ip } = inode;
        let guard = self.itable.inner.lock();

        // Strong count 2 means the table and this handle are the only
        // owners, so nobody can hold the sleep-lock: this acquire will
        // not block.
        if Arc::strong_count(&ip) == 2 {
            let mut idata = ip.data.lock();
            drop(guard);

            if idata.valid && idata.nlink == 0 {
                // No links and no other references: truncate and free.
                idata.trunc(self);
                idata.itype = IType::None;
                idata.update(self);
                idata.valid = false;
            }
            drop(idata);

            let mut guard = self.itable.inner.lock();
            for slot in guard.iter_mut() {
                if slot.as_ref().map_or(false, |s| Arc::ptr_eq(s, &ip)) {
                    *slot = None;
                }
            }
        }
    }

    // Path resolution.
    //
    // Look up a path one component at a time, holding at most one inode
    // lock so walks crossing in opposite directions cannot deadlock.
    // Must be called inside a transaction since it calls iput.

    fn namex<'p>(
        &self,
        path: &'p Path,
        parent: bool,
        start: Option<&Inode>,
    ) -> Result<(&'p str, Inode)> {
        let mut ip = if path.is_absolute() || start.is_none() {
            self.root()
        } else {
            start.unwrap().dup()
        };

        let mut path = path;
        loop {
            let (name, rest) = match path.skip_elem() {
                Some(x) => x,
                None => {
                    if parent {
                        // "" and "/" have no parent to give back.
                        self.iput(ip);
                        return Err(Error::NotFound);
                    }
                    return Ok(("", ip));
                }
            };

            let mut guard = ip.lock(self);
            if guard.itype() != IType::Dir {
                drop(guard);
                self.iput(ip);
                return Err(Error::NotADirectory);
            }
            if parent && rest.as_str().is_empty() {
                // Stop one level early, returning the parent unlocked
                // but referenced, plus the final component.
                drop(guard);
                return Ok((name, ip));
            }
            match guard.dirlookup(self, name, None) {
                Some(next) => {
                    drop(guard);
                    self.iput(ip);
                    ip = next;
                    path = rest;
                }
                None => {
                    drop(guard);
                    self.iput(ip);
                    return Err(Error::NotFound);
                }
            }
        }
    }

    /// Resolve a path to a referenced inode. Absolute paths (and, with
    /// no start directory, relative ones) begin at the root.
    pub fn namei(&self, path: &Path) -> Result<Inode> {
        self.namex(path, false, None).map(|(_, ip)| ip)
    }

    /// Resolve a path from a starting directory.
    pub fn namei_from(&self, start: &Inode, path: &Path) -> Result<Inode> {
        self.namex(path, false, Some(start)).map(|(_, ip)| ip)
    }

    /// Resolve to the parent directory of the path's last component,
    /// returning the component as well.
    pub fn nameiparent<'p>(&self, path: &'p Path) -> Result<(&'p str, Inode)> {
        self.namex(path, true, None)
    }

    // Whole operations stitched from the layers above. All assume the
    // caller opened a transaction.

    /// Create `path` as an inode of the given type, seeding "." and ".."
    /// for directories. Creating an existing file is a success for
    /// plain files (the existing inode is returned), an error otherwise.
    pub fn create(&self, path: &Path, itype: IType, major: i16, minor: i16) -> Result<Inode> {
        let (name, dp) = self.nameiparent(path)?;
        if name.len() > DIRSIZ {
            self.iput(dp);
            return Err(Error::InvalidPath);
        }
        let mut dp_guard = dp.lock(self);

        if let Some(ip) = dp_guard.dirlookup(self, name, None) {
            drop(dp_guard);
            self.iput(dp);
            let ip_guard = ip.lock(self);
            if itype == IType::File
                && matches!(ip_guard.itype(), IType::File | IType::Device)
            {
                drop(ip_guard);
                return Ok(ip);
            }
            drop(ip_guard);
            self.iput(ip);
            return Err(Error::AlreadyExists);
        }

        let ip = self.ialloc(itype);
        let mut ip_guard = ip.lock(self);
        ip_guard.major = major;
        ip_guard.minor = minor;
        ip_guard.nlink = 1;
        ip_guard.update(self);

        if itype == IType::Dir {
            // Create . and .. entries. No nlink++ for ".": avoid a
            // cyclic reference count.
            ip_guard
                .dirlink(self, ".", ip.inum())
                .expect("create: dot dirlink");
            ip_guard
                .dirlink(self, "..", dp.inum())
                .expect("create: dotdot dirlink");
        }

        dp_guard
            .dirlink(self, name, ip.inum())
            .expect("create: dirlink");

        if itype == IType::Dir {
            dp_guard.nlink += 1; // for ".."
            dp_guard.update(self);
        }

        drop(dp_guard);
        self.iput(dp);
        drop(ip_guard);
        Ok(ip)
    }

    /// Create `new` as another name for the inode at `old`.
    pub fn link(&self, old: &Path, new: &Path) -> Result<()> {
        let ip = self.namei(old)?;
        {
            let mut guard = ip.lock(self);
            if guard.itype() == IType::Dir {
                drop(guard);
                self.iput(ip);
                return Err(Error::IsDirectory);
            }
            guard.nlink += 1;
            guard.update(self);
        }

        let res = (|| {
            let (name, dp) = self.nameiparent(new)?;
            let mut dp_guard = dp.lock(self);
            let linked = if dp.dev() == ip.dev() {
                dp_guard.dirlink(self, name, ip.inum())
            } else {
                Err(Error::NotFound)
            };
            drop(dp_guard);
            self.iput(dp);
            linked
        })();

        match res {
            Ok(()) => {
                self.iput(ip);
                Ok(())
            }
            Err(e) => {
                // Undo the link count; the entry was never written.
                let mut guard = ip.lock(self);
                guard.nlink -= 1;
                guard.update(self);
                drop(guard);
                self.iput(ip);
                Err(e)
            }
        }
    }

    /// Remove the directory entry at `path`, dropping the target's link
    /// count; its blocks are freed when the last reference goes away.
    pub fn unlink(&self, path: &Path) -> Result<()> {
        let (name, dp) = self.nameiparent(path)?;
        let mut dp_guard = dp.lock(self);

        // Cannot unlink "." or "..".
        if name == "." || name == ".." {
            drop(dp_guard);
            self.iput(dp);
            return Err(Error::InvalidPath);
        }

        let mut off = 0u32;
        let ip = match dp_guard.dirlookup(self, name, Some(&mut off)) {
            Some(ip) => ip,
            None => {
                drop(dp_guard);
                self.iput(dp);
                return Err(Error::NotFound);
            }
        };
        let mut ip_guard = ip.lock(self);

        assert!(ip_guard.nlink() >= 1, "unlink: nlink < 1");
        if ip_guard.itype() == IType::Dir && !ip_guard.is_dir_empty(self) {
            drop(ip_guard);
            self.iput(ip);
            drop(dp_guard);
            self.iput(dp);
            return Err(Error::NotEmpty);
        }

        let de = Dirent::new_zeroed();
        let n = dp_guard
            .write(self, de.as_bytes(), off)
            .expect("unlink: dirent clear");
        assert_eq!(n, DIRENT_SIZE);

        if ip_guard.itype() == IType::Dir {
            dp_guard.nlink -= 1;
            dp_guard.update(self);
        }
        drop(dp_guard);
        self.iput(dp);

        ip_guard.nlink -= 1;
        ip_guard.update(self);
        drop(ip_guard);
        self.iput(ip);
        Ok(())
    }

    // File-level helpers: lock, transfer, unlock, with writes chunked
    // so a single transaction never overruns its log reservation.

    /// Read up to dst.len() bytes from the file at `off`.
    pub fn read_at(&self, ip: &Inode, dst: &mut [u8], off: u32) -> usize {
        let mut guard = ip.lock(self);
        guard.read(self, dst, off)
    }

    /// Write all of src to the file at `off`, splitting the work across
    /// transactions. Returns the bytes written.
    pub fn write_at(&self, ip: &Inode, src: &[u8], off: u32) -> Result<usize> {
        // Room for the data blocks plus inode, indirect blocks and
        // bitmap, times two since a block may straddle the chunk edge.
        let max = ((MAXOPBLOCKS - 4) / 2) * BSIZE;
        let mut done = 0;
        while done < src.len() {
            let n = core::cmp::min(src.len() - done, max);
            self.begin_op();
            let mut guard = ip.lock(self);
            let r = guard.write(self, &src[done..done + n], off + done as u32);
            drop(guard);
            self.end_op();
            match r {
                Ok(written) => {
                    done += written;
                    if written < n {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::mkfs;

    #[test]
    fn layout_constants() {
        assert_eq!(DINODE_SIZE, 64);
        assert_eq!(IPB, 16);
        assert_eq!(DIRENT_SIZE, 16);
        assert_eq!(NINDIRECT, 256);
        assert_eq!(MAXFILE, 11 + 256 + 256 * 256);
    }

    #[test]
    fn skip_elem_vectors() {
        let split = |s: &'static str| {
            Path::new(s)
                .skip_elem()
                .map(|(name, rest)| (name, rest.as_str().to_string()))
        };
        assert_eq!(split("a/bb/c"), Some(("a", "bb/c".to_string())));
        assert_eq!(split("///a//bb"), Some(("a", "//bb".to_string())));
        assert_eq!(split("a"), Some(("a", String::new())));
        assert_eq!(split("a/"), Some(("a", "/".to_string())));
        assert_eq!(split(""), None);
        assert_eq!(split("////"), None);
    }

    #[test]
    fn dirent_names() {
        let mut de = Dirent::new_zeroed();
        de.set_name("hello");
        assert_eq!(de.name(), "hello");
        de.set_name("exactly14bytes");
        assert_eq!(de.name(), "exactly14bytes");
        assert!(namecmp(de.name(), "exactly14bytes"));
        assert!(!namecmp("a", "b"));
    }

    #[test]
    fn absorption_uses_one_slot() {
        let fs = mkfs::format(Arc::new(MemDisk::new(200)), 200, 64);
        fs.begin_op();
        let before = fs.log.n_logged();
        // Two logged writes of the same block must consume one slot.
        let mut bp = fs.cache.read(fs.dev, fs.sb.bmapstart);
        let b0 = bp[0];
        bp[0] = b0;
        fs.log.write(bp);
        let mut bp = fs.cache.read(fs.dev, fs.sb.bmapstart);
        bp[0] = b0;
        fs.log.write(bp);
        assert_eq!(fs.log.n_logged(), before + 1);
        fs.end_op();
    }

    #[test]
    fn ialloc_finds_first_free() {
        let fs = mkfs::format(Arc::new(MemDisk::new(200)), 200, 64);
        fs.begin_op();
        let ip = fs.ialloc(IType::File);
        // Root took inum 1 at format time.
        assert_eq!(ip.inum(), 2);
        let mut guard = ip.lock(&fs);
        guard.nlink = 0;
        guard.update(&fs);
        drop(guard);
        fs.iput(ip);
        fs.end_op();
    }
}
