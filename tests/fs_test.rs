// End-to-end tests over a memory disk: format, remount, crash points
// (a crash is a snapshot of the image as of the last completed write),
// concurrency, and the block-map edges.

use oxfs::{
    mkfs, BlockDevice, Error, FileSystem, IType, MemDisk, Path, BSIZE, DIRSIZ, NDIRECT, NINDIRECT,
    ROOTINO,
};
use std::sync::Arc;

const DIRENT_SIZE: usize = 16;

fn fresh(size: u32, ninodes: u32) -> (FileSystem, MemDisk) {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = MemDisk::new(size);
    let fs = mkfs::format(Arc::new(disk.clone()), size, ninodes);
    (fs, disk)
}

/// Zero bits in the allocation bitmap, read straight off the image.
fn free_block_count(disk: &MemDisk, fs: &FileSystem) -> u32 {
    let sb = fs.superblock();
    let mut free = 0;
    let mut buf = [0u8; BSIZE];
    for b in 0..sb.size {
        if b % (BSIZE as u32 * 8) == 0 {
            disk.read_block(sb.bblock(b), &mut buf);
        }
        let bi = (b % (BSIZE as u32 * 8)) as usize;
        if buf[bi / 8] & (1 << (bi % 8)) == 0 {
            free += 1;
        }
    }
    free
}

/// The on-disk type field of inode `inum`, read straight off the image.
fn raw_inode_type(disk: &MemDisk, fs: &FileSystem, inum: u32) -> i16 {
    let sb = fs.superblock();
    let mut buf = [0u8; BSIZE];
    disk.read_block(sb.iblock(inum), &mut buf);
    let off = (inum as usize % 16) * 64;
    i16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

#[test]
fn format_then_remount_root() {
    let (fs, disk) = fresh(200, 200);
    drop(fs);

    let fs = FileSystem::mount(Arc::new(disk));
    let root = fs.root();
    assert_eq!(root.inum(), ROOTINO);
    let guard = root.lock(&fs);
    assert_eq!(guard.itype(), IType::Dir);
    assert_eq!(guard.size() as usize, 2 * DIRENT_SIZE);
    let st = guard.stat();
    assert_eq!(st.ino, ROOTINO);
    assert_eq!(st.nlink, 1);
    drop(guard);
    fs.begin_op();
    fs.iput(root);
    fs.end_op();
}

#[test]
fn committed_write_survives_remount() {
    let (fs, disk) = fresh(200, 64);

    fs.begin_op();
    let ip = fs.create(Path::new("/hello"), IType::File, 0, 0).unwrap();
    let mut guard = ip.lock(&fs);
    assert_eq!(guard.write(&fs, b"hello", 0).unwrap(), 5);
    guard.update(&fs);
    drop(guard);
    fs.iput(ip);
    fs.end_op();

    // Crash immediately after end_op returned.
    let fs = FileSystem::mount(Arc::new(disk.snapshot()));
    fs.begin_op();
    let ip = fs.namei(Path::new("/hello")).unwrap();
    fs.end_op();
    let mut out = [0u8; 16];
    let mut guard = ip.lock(&fs);
    assert_eq!(guard.size(), 5);
    assert_eq!(guard.read(&fs, &mut out[..5], 0), 5);
    assert_eq!(&out[..5], b"hello");
    drop(guard);
    fs.begin_op();
    fs.iput(ip);
    fs.end_op();
}

#[test]
fn uncommitted_op_leaves_no_trace() {
    let (fs, disk) = fresh(200, 64);
    let free_before = free_block_count(&disk, &fs);

    fs.begin_op();
    let ip = fs.create(Path::new("/ghost"), IType::File, 0, 0).unwrap();
    let mut guard = ip.lock(&fs);
    guard.write(&fs, &[7u8; 2 * BSIZE], 0).unwrap();
    drop(guard);
    fs.iput(ip);

    // Crash before end_op: nothing reached the log header, so the
    // mounted snapshot must look untouched.
    let crashed = FileSystem::mount(Arc::new(disk.snapshot()));
    assert_eq!(
        fs_namei_result(&crashed, "/ghost"),
        Err(Error::NotFound),
        "half-done create leaked into the snapshot"
    );
    let snap = disk.snapshot();
    assert_eq!(free_block_count(&snap, &crashed), free_before);

    // Back on the live system the op completes and commits.
    fs.end_op();
    let recovered = FileSystem::mount(Arc::new(disk.snapshot()));
    assert!(fs_namei_result(&recovered, "/ghost").is_ok());
}

fn fs_namei_result(fs: &FileSystem, path: &str) -> Result<u32, Error> {
    fs.begin_op();
    let r = fs.namei(Path::new(path)).map(|ip| {
        let inum = ip.inum();
        fs.iput(ip);
        inum
    });
    fs.end_op();
    r
}

#[test]
fn committed_log_replays_on_mount() {
    let (fs, disk) = fresh(200, 64);
    let sb = *fs.superblock();
    drop(fs);

    // Hand-craft a committed-but-uninstalled log: payload in the log
    // region, header pointing it at a free data block. This is the
    // window between write_head and install_trans.
    let target = sb.size - 1;
    let mut payload = [0u8; BSIZE];
    payload[..4].copy_from_slice(b"redo");
    disk.write_block(sb.logstart + 1, &payload);

    let mut head = [0u8; BSIZE];
    head[..4].copy_from_slice(&1u32.to_le_bytes());
    head[4..8].copy_from_slice(&target.to_le_bytes());
    disk.write_block(sb.logstart, &head);

    let fs = FileSystem::mount(Arc::new(disk.clone()));
    let mut out = [0u8; BSIZE];
    disk.read_block(target, &mut out);
    assert_eq!(&out[..4], b"redo", "replay did not install the payload");

    // The header must be cleared afterwards...
    disk.read_block(sb.logstart, &mut out);
    assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), 0);
    drop(fs);

    // ...and replaying an already-installed log must be a no-op.
    let _fs = FileSystem::mount(Arc::new(disk.clone()));
    disk.read_block(target, &mut out);
    assert_eq!(&out[..4], b"redo");
}

#[test]
fn unwritten_header_discards_payloads() {
    let (fs, disk) = fresh(200, 64);
    let sb = *fs.superblock();
    drop(fs);

    let target = sb.size - 1;
    let mut payload = [0u8; BSIZE];
    payload[..5].copy_from_slice(b"lost!");
    disk.write_block(sb.logstart + 1, &payload);
    // Header still says n = 0: the transaction never committed.

    let _fs = FileSystem::mount(Arc::new(disk.clone()));
    let mut out = [0u8; BSIZE];
    disk.read_block(target, &mut out);
    assert_eq!(out, [0u8; BSIZE], "uncommitted payload was installed");
}

#[test]
fn concurrent_ops_share_one_commit() {
    let (fs, _disk) = fresh(400, 64);
    let fs = &fs;
    std::thread::scope(|s| {
        for t in 0..2u32 {
            s.spawn(move || {
                let path = format!("/file{}", t);
                let body = vec![t as u8 + 1; 6 * BSIZE];
                fs.begin_op();
                let ip = fs.create(Path::new(&path), IType::File, 0, 0).unwrap();
                let mut guard = ip.lock(fs);
                assert_eq!(guard.write(fs, &body, 0).unwrap(), body.len());
                drop(guard);
                fs.iput(ip);
                fs.end_op();
            });
        }
    });

    for t in 0..2u32 {
        let path = format!("/file{}", t);
        fs.begin_op();
        let ip = fs.namei(Path::new(&path)).unwrap();
        fs.end_op();
        let mut out = vec![0u8; 6 * BSIZE];
        assert_eq!(fs.read_at(&ip, &mut out, 0), out.len());
        assert!(out.iter().all(|&b| b == t as u8 + 1));
        fs.begin_op();
        fs.iput(ip);
        fs.end_op();
    }
}

#[test]
fn doubly_indirect_file_round_trip_and_truncate() {
    let (fs, disk) = fresh(400, 64);
    let free_before = free_block_count(&disk, &fs);

    let nblocks = NDIRECT + NINDIRECT + 5;
    let mut body = vec![0u8; nblocks * BSIZE];
    for (i, chunk) in body.chunks_mut(BSIZE).enumerate() {
        chunk.fill((i % 251) as u8);
    }

    fs.begin_op();
    let ip = fs.create(Path::new("/big"), IType::File, 0, 0).unwrap();
    fs.end_op();
    assert_eq!(fs.write_at(&ip, &body, 0).unwrap(), body.len());

    let mut out = vec![0u8; body.len()];
    assert_eq!(fs.read_at(&ip, &mut out, 0), body.len());
    assert_eq!(out, body, "data mangled crossing the indirect boundaries");

    // Reads past the end return nothing.
    assert_eq!(fs.read_at(&ip, &mut out[..16], body.len() as u32 + 1), 0);

    // Data blocks plus the indirect, doubly-indirect and one mid-level
    // block are all accounted for...
    let inum = ip.inum();
    let during = free_block_count(&disk, &fs);
    assert_eq!(free_before - during, nblocks as u32 + 3);

    fs.begin_op();
    fs.iput(ip);
    fs.end_op();

    // ...and all come back when the last link and reference go away.
    fs.begin_op();
    fs.unlink(Path::new("/big")).unwrap();
    fs.end_op();

    assert_eq!(free_block_count(&disk, &fs), free_before);
    assert_eq!(raw_inode_type(&disk, &fs, inum), 0);
}

#[test]
fn write_clips_and_rejects() {
    let (fs, _disk) = fresh(200, 64);
    fs.begin_op();
    let ip = fs.create(Path::new("/clip"), IType::File, 0, 0).unwrap();
    let mut guard = ip.lock(&fs);
    // A write may not start past the end of the file.
    assert_eq!(guard.write(&fs, b"x", 10), Err(Error::InvalidOffset));
    assert_eq!(guard.write(&fs, b"abc", 0).unwrap(), 3);
    // Reads clip to the size.
    let mut out = [0u8; 8];
    assert_eq!(guard.read(&fs, &mut out, 1), 2);
    assert_eq!(&out[..2], b"bc");
    assert_eq!(guard.read(&fs, &mut out, 64), 0);
    drop(guard);
    fs.iput(ip);
    fs.end_op();
}

#[test]
fn link_unlink_bookkeeping() {
    let (fs, _disk) = fresh(200, 64);

    fs.begin_op();
    let ip = fs.create(Path::new("/a"), IType::File, 0, 0).unwrap();
    let mut guard = ip.lock(&fs);
    guard.write(&fs, b"payload", 0).unwrap();
    drop(guard);
    fs.iput(ip);
    fs.end_op();

    fs.begin_op();
    fs.link(Path::new("/a"), Path::new("/b")).unwrap();
    fs.end_op();

    fs.begin_op();
    let ip = fs.namei(Path::new("/b")).unwrap();
    fs.end_op();
    let guard = ip.lock(&fs);
    assert_eq!(guard.nlink(), 2);
    drop(guard);
    fs.begin_op();
    fs.iput(ip);
    fs.end_op();

    fs.begin_op();
    fs.unlink(Path::new("/a")).unwrap();
    fs.end_op();

    let mut out = [0u8; 7];
    fs.begin_op();
    let ip = fs.namei(Path::new("/b")).unwrap();
    fs.end_op();
    assert_eq!(fs.read_at(&ip, &mut out, 0), 7);
    assert_eq!(&out, b"payload");
    fs.begin_op();
    fs.iput(ip);
    fs.end_op();

    fs.begin_op();
    fs.unlink(Path::new("/b")).unwrap();
    fs.end_op();
    assert_eq!(fs_namei_result(&fs, "/b"), Err(Error::NotFound));
}

#[test]
fn directory_semantics() {
    let (fs, _disk) = fresh(200, 64);

    fs.begin_op();
    let dir = fs.create(Path::new("/d"), IType::Dir, 0, 0).unwrap();
    fs.iput(dir);
    let file = fs.create(Path::new("/d/f"), IType::File, 0, 0).unwrap();
    fs.iput(file);
    fs.end_op();

    // Creating an existing plain file hands back the same inode;
    // creating an existing directory is refused.
    fs.begin_op();
    let again = fs.create(Path::new("/d/f"), IType::File, 0, 0).unwrap();
    fs.iput(again);
    assert_eq!(
        fs.create(Path::new("/d"), IType::Dir, 0, 0).unwrap_err(),
        Error::AlreadyExists
    );

    // A populated directory will not unlink, and dot entries never do.
    assert_eq!(fs.unlink(Path::new("/d")).unwrap_err(), Error::NotEmpty);
    assert_eq!(fs.unlink(Path::new("/d/.")).unwrap_err(), Error::InvalidPath);

    // Hard-linking a directory is refused.
    assert_eq!(
        fs.link(Path::new("/d"), Path::new("/d2")).unwrap_err(),
        Error::IsDirectory
    );

    fs.unlink(Path::new("/d/f")).unwrap();
    fs.unlink(Path::new("/d")).unwrap();
    fs.end_op();
    assert_eq!(fs_namei_result(&fs, "/d"), Err(Error::NotFound));
}

#[test]
fn path_resolution_edges() {
    let (fs, _disk) = fresh(200, 64);

    assert_eq!(fs_namei_result(&fs, "/").unwrap(), ROOTINO);
    assert_eq!(fs_namei_result(&fs, "///").unwrap(), ROOTINO);
    assert_eq!(fs_namei_result(&fs, "/..").unwrap(), ROOTINO);
    assert_eq!(fs_namei_result(&fs, "/nope"), Err(Error::NotFound));

    fs.begin_op();
    let ip = fs.create(Path::new("/f"), IType::File, 0, 0).unwrap();
    fs.iput(ip);
    fs.end_op();

    // Walking through a plain file fails.
    assert_eq!(fs_namei_result(&fs, "/f/x"), Err(Error::NotADirectory));

    // The parent of nothing does not exist.
    fs.begin_op();
    assert_eq!(
        fs.nameiparent(Path::new("/")).map(|_| ()),
        Err(Error::NotFound)
    );
    assert_eq!(
        fs.nameiparent(Path::new("")).map(|_| ()),
        Err(Error::NotFound)
    );
    let (name, dp) = fs.nameiparent(Path::new("/d2")).unwrap();
    assert_eq!(name, "d2");
    assert_eq!(dp.inum(), ROOTINO);
    fs.iput(dp);
    fs.end_op();

    // Component names longer than DIRSIZ cannot be created.
    fs.begin_op();
    let long = format!("/{}", "x".repeat(DIRSIZ + 1));
    assert_eq!(
        fs.create(Path::new(&long), IType::File, 0, 0).unwrap_err(),
        Error::InvalidPath
    );
    fs.end_op();
}

#[test]
fn over_long_lookup_does_not_alias_prefix() {
    let (fs, _disk) = fresh(200, 64);

    // An entry of exactly DIRSIZ bytes, and queries that extend it.
    let full = "abcdefghijklmn";
    assert_eq!(full.len(), DIRSIZ);
    fs.begin_op();
    let ip = fs
        .create(Path::new(&format!("/{}", full)), IType::File, 0, 0)
        .unwrap();
    fs.iput(ip);
    fs.end_op();

    // A longer name sharing the stored prefix must not resolve to it,
    // and certainly must not delete it.
    let longer = format!("/{}XYZ", full);
    assert_eq!(fs_namei_result(&fs, &longer), Err(Error::NotFound));
    fs.begin_op();
    assert_eq!(fs.unlink(Path::new(&longer)).unwrap_err(), Error::NotFound);
    fs.end_op();

    // The real entry is untouched and still reachable by its own name.
    assert!(fs_namei_result(&fs, &format!("/{}", full)).is_ok());
    fs.begin_op();
    fs.unlink(Path::new(&format!("/{}", full))).unwrap();
    fs.end_op();
    assert_eq!(
        fs_namei_result(&fs, &format!("/{}", full)),
        Err(Error::NotFound)
    );
}

#[test]
fn crossing_walks_do_not_deadlock() {
    let (fs, _disk) = fresh(400, 64);

    fs.begin_op();
    for p in ["/a", "/a/b", "/b", "/b/a"] {
        let ip = fs.create(Path::new(p), IType::Dir, 0, 0).unwrap();
        fs.iput(ip);
    }
    fs.end_op();

    let fs = &fs;
    std::thread::scope(|s| {
        for &path in &["/a/b", "/b/a"] {
            for _ in 0..4 {
                s.spawn(move || {
                    for _ in 0..200 {
                        fs.begin_op();
                        let ip = fs.namei(Path::new(path)).unwrap();
                        fs.iput(ip);
                        fs.end_op();
                    }
                });
            }
        }
    });
    // Reaching this line is the assertion: every walk completed.
}

#[test]
fn remount_after_heavy_traffic_is_consistent() {
    let (fs, disk) = fresh(400, 64);

    for t in 0..8u32 {
        let path = format!("/t{}", t);
        fs.begin_op();
        let ip = fs.create(Path::new(&path), IType::File, 0, 0).unwrap();
        fs.end_op();
        let body = vec![t as u8; (t as usize + 1) * 512];
        fs.write_at(&ip, &body, 0).unwrap();
        fs.begin_op();
        fs.iput(ip);
        fs.end_op();
    }
    fs.begin_op();
    fs.unlink(Path::new("/t3")).unwrap();
    fs.unlink(Path::new("/t6")).unwrap();
    fs.end_op();
    drop(fs);

    let fs = FileSystem::mount(Arc::new(disk.snapshot()));
    for t in 0..8u32 {
        let path = format!("/t{}", t);
        if t == 3 || t == 6 {
            assert_eq!(fs_namei_result(&fs, &path), Err(Error::NotFound));
            continue;
        }
        fs.begin_op();
        let ip = fs.namei(Path::new(&path)).unwrap();
        fs.end_op();
        let mut out = vec![0u8; (t as usize + 1) * 512];
        assert_eq!(fs.read_at(&ip, &mut out, 0), out.len());
        assert!(out.iter().all(|&b| b == t as u8));
        fs.begin_op();
        fs.iput(ip);
        fs.end_op();
    }
}
