// Sizing knobs for the in-memory caches and the log.

/// Device number of the (only) disk.
pub const ROOTDEV: u32 = 1;

/// Max data blocks any single file-system operation may write.
pub const MAXOPBLOCKS: usize = 10;

/// Max blocks the on-disk log region holds, header excluded.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of the buffer cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Number of hash buckets the buffer cache is partitioned into.
/// A small prime, so consecutive block numbers spread out.
pub const NBUFMAP_BUCKET: usize = 13;

/// Size of the in-memory inode table.
pub const NINODE: usize = 50;
