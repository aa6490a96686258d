// Buffer cache.
//
// Holds cached copies of disk block contents in a fixed arena of NBUF
// slots, so a block read by one thread is visible to the next without
// another disk round trip.
//
// Interface:
// * To get a buffer for a particular disk block, call BCache::read.
// * After changing buffer data, call BufGuard::write to flush it.
// * Dropping the guard releases the buffer.
// * pin/unpin keep a buffer resident while the log holds its payload
//   hostage between log_write and commit.
//
// Buffers are partitioned into NBUFMAP_BUCKET hash buckets keyed by
// (dev, blockno). A buffer's metadata (identity, refcnt, lastuse) lives
// inside exactly one bucket's spinlock at a time; payloads live in the
// arena under per-slot sleep-locks. Lookups touch one bucket. A miss
// serializes on the key's eviction lock, then steals the globally
// least-recently-used free slot with a hand-over-hand scan: the lock of
// the bucket holding the current best candidate stays held so the victim
// cannot be re-referenced between selection and excision.

use crate::disk::BlockDevice;
use crate::fs::BSIZE;
use crate::param::{NBUF, NBUFMAP_BUCKET};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::sync::{SpinLock, SpinLockGuard};
use array_macro::array;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct BCache {
    disk: Arc<dyn BlockDevice>,
    buckets: [SpinLock<Bucket>; NBUFMAP_BUCKET],
    evictions: [SpinLock<()>; NBUFMAP_BUCKET],
    slots: [SleepLock<BufData>; NBUF],
    ticks: AtomicU64,
}

struct Bucket {
    bufs: Vec<BufMeta>,
}

struct BufMeta {
    id: usize,
    dev: u32,
    blockno: u32,
    refcnt: u32,
    lastuse: u64,
}

pub struct BufData {
    dev: u32,
    blockno: u32,
    valid: bool,
    data: [u8; BSIZE],
}

impl BufData {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            valid: false,
            data: [0; BSIZE],
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }
}

impl Deref for BufData {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A referenced, sleep-locked buffer. Dropping it releases the lock and
/// the reference; the slot becomes an eviction candidate once the last
/// reference (pins included) is gone.
pub struct BufGuard<'a> {
    cache: &'a BCache,
    id: usize,
    dev: u32,
    blockno: u32,
    guard: Option<SleepLockGuard<'a, BufData>>,
}

impl BCache {
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let cache = Self {
            disk,
            buckets: array![_ => SpinLock::new(Bucket { bufs: Vec::new() }, "bcache.bucket"); NBUFMAP_BUCKET],
            evictions: array![_ => SpinLock::new((), "bcache.evict"); NBUFMAP_BUCKET],
            slots: array![_ => SleepLock::new(BufData::new(), "buffer"); NBUF],
            ticks: AtomicU64::new(1),
        };
        // Spread the fresh slots round-robin so early eviction scans are
        // not all fighting over bucket zero.
        for id in 0..NBUF {
            cache.buckets[id % NBUFMAP_BUCKET].lock().bufs.push(BufMeta {
                id,
                dev: 0,
                blockno: 0,
                refcnt: 0,
                lastuse: 0,
            });
        }
        cache
    }

    fn hash(dev: u32, blockno: u32) -> usize {
        ((((dev as u64) << 27) | blockno as u64) % NBUFMAP_BUCKET as u64) as usize
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let mut b = self.bget(dev, blockno);
        if !b.valid {
            let data = b.guard.as_mut().unwrap();
            self.disk.read_block(blockno, &mut data.data);
            data.valid = true;
        }
        b
    }

    /// Look up the block in the cache, recycling the least-recently-used
    /// free slot on a miss. Returns the buffer referenced and sleep-locked.
    fn bget(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let key = Self::hash(dev, blockno);

        // Fast path: already cached?
        {
            let mut bucket = self.buckets[key].lock();
            if let Some(m) = bucket
                .bufs
                .iter_mut()
                .find(|m| m.dev == dev && m.blockno == blockno)
            {
                m.refcnt += 1;
                let id = m.id;
                drop(bucket);
                return self.take_slot(id, dev, blockno);
            }
        }

        // Miss. Serialize installs for this key so concurrent misses do
        // not each evict a victim for the same block.
        let eviction = self.evictions[key].lock();

        // Another thread may have installed the block while we waited.
        {
            let mut bucket = self.buckets[key].lock();
            if let Some(m) = bucket
                .bufs
                .iter_mut()
                .find(|m| m.dev == dev && m.blockno == blockno)
            {
                m.refcnt += 1;
                let id = m.id;
                drop(bucket);
                drop(eviction);
                return self.take_slot(id, dev, blockno);
            }
        }

        // Pick the globally least-recently-used free buffer, scanning
        // buckets in index order and keeping the lock of whichever bucket
        // currently holds the best candidate.
        let mut best: Option<(usize, SpinLockGuard<'_, Bucket>, usize, u64)> = None;
        for i in 0..NBUFMAP_BUCKET {
            let bucket = self.buckets[i].lock();
            let local = bucket
                .bufs
                .iter()
                .enumerate()
                .filter(|(_, m)| m.refcnt == 0)
                .min_by_key(|(_, m)| m.lastuse)
                .map(|(pos, m)| (pos, m.lastuse));
            if let Some((pos, lastuse)) = local {
                match &best {
                    Some((_, _, _, best_lastuse)) if *best_lastuse <= lastuse => {}
                    _ => best = Some((i, bucket, pos, lastuse)),
                }
            }
        }

        let (h, mut hbucket, pos, _) = match best {
            Some(b) => b,
            None => panic!("bget: no buffers"),
        };

        let mut meta = hbucket.bufs.swap_remove(pos);
        let mut bucket = if h == key {
            hbucket
        } else {
            drop(hbucket);
            self.buckets[key].lock()
        };

        meta.dev = dev;
        meta.blockno = blockno;
        meta.refcnt = 1;
        let id = meta.id;

        // The victim's refcnt was zero, so its sleep-lock is free and this
        // acquire cannot block while we hold the bucket lock. Rewriting
        // the identity here closes the window where another thread could
        // observe the new identity with stale payload flags.
        let mut data = self.slots[id].lock();
        data.dev = dev;
        data.blockno = blockno;
        data.valid = false;

        bucket.bufs.push(meta);
        drop(bucket);
        drop(eviction);

        BufGuard {
            cache: self,
            id,
            dev,
            blockno,
            guard: Some(data),
        }
    }

    /// Sleep-lock an already-referenced slot. No spinlock is held here,
    /// so blocking on a contended buffer is fine.
    fn take_slot(&self, id: usize, dev: u32, blockno: u32) -> BufGuard<'_> {
        let guard = self.slots[id].lock();
        BufGuard {
            cache: self,
            id,
            dev,
            blockno,
            guard: Some(guard),
        }
    }

    /// Adjust a buffer's reference count under its bucket lock.
    fn adjust_refcnt(&self, dev: u32, blockno: u32, id: usize, delta: i32) {
        let key = Self::hash(dev, blockno);
        let mut bucket = self.buckets[key].lock();
        let m = bucket
            .bufs
            .iter_mut()
            .find(|m| m.id == id)
            .expect("refcnt: buffer not in its bucket");
        if delta < 0 {
            assert!(m.refcnt >= (-delta) as u32, "refcnt underflow");
            m.refcnt -= (-delta) as u32;
        } else {
            m.refcnt += delta as u32;
        }
        if m.refcnt == 0 {
            m.lastuse = self.ticks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl BufGuard<'_> {
    /// Write the buffer's contents to disk. The caller holds the lock by
    /// construction.
    pub fn write(&mut self) {
        let data = self.guard.as_ref().unwrap();
        self.cache.disk.write_block(data.blockno, &data.data);
    }

    /// Keep the buffer resident after this guard is gone; paired with
    /// `unpin` at commit time.
    pub fn pin(&self) {
        self.cache.adjust_refcnt(self.dev, self.blockno, self.id, 1);
    }

    pub fn unpin(&self) {
        self.cache.adjust_refcnt(self.dev, self.blockno, self.id, -1);
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }
}

impl<'a> Deref for BufGuard<'a> {
    type Target = BufData;
    fn deref(&self) -> &BufData {
        self.guard.as_ref().unwrap()
    }
}

impl<'a> DerefMut for BufGuard<'a> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.guard.as_mut().unwrap()
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Release the sleep-lock before touching the bucket, so a zero
        // refcnt always implies a free sleep-lock.
        self.guard.take();
        self.cache.adjust_refcnt(self.dev, self.blockno, self.id, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::param::ROOTDEV;

    fn cache_over(blocks: u32) -> (BCache, MemDisk) {
        let disk = MemDisk::new(blocks);
        let cache = BCache::new(Arc::new(disk.clone()));
        (cache, disk)
    }

    #[test]
    fn read_write_read() {
        let (cache, disk) = cache_over(64);
        {
            let mut b = cache.read(ROOTDEV, 7);
            b[0] = 0x5a;
            b[BSIZE - 1] = 0xa5;
            b.write();
        }
        let mut raw = [0u8; BSIZE];
        disk.read_block(7, &mut raw);
        assert_eq!(raw[0], 0x5a);
        assert_eq!(raw[BSIZE - 1], 0xa5);

        let b = cache.read(ROOTDEV, 7);
        assert_eq!(b[0], 0x5a);
        assert_eq!(b.blockno(), 7);
        assert_eq!(b.dev(), ROOTDEV);
    }

    #[test]
    fn eviction_cycles_through_all_slots() {
        let (cache, _disk) = cache_over(4 * NBUF as u32);
        // Dirty every block through the cache, forcing NBUF recycles.
        for bn in 0..3 * NBUF as u32 {
            let mut b = cache.read(ROOTDEV, bn);
            b[0] = bn as u8;
            b.write();
        }
        // Everything must still read back correctly after its slot was
        // reused several times over.
        for bn in 0..3 * NBUF as u32 {
            let b = cache.read(ROOTDEV, bn);
            assert_eq!(b[0], bn as u8, "block {} corrupted by recycling", bn);
        }
    }

    #[test]
    fn pin_prevents_eviction() {
        let (cache, _disk) = cache_over(4 * NBUF as u32);
        {
            let mut b = cache.read(ROOTDEV, 3);
            // Cache-only modification: never written to disk, so only the
            // cached copy can show it.
            b[0] = 0xee;
            b.pin();
        }
        for bn in 100..100 + 2 * NBUF as u32 {
            let _ = cache.read(ROOTDEV, bn);
        }
        {
            let b = cache.read(ROOTDEV, 3);
            assert_eq!(b[0], 0xee, "pinned buffer was evicted");
            b.unpin();
        }
        for bn in 200..200 + 2 * NBUF as u32 {
            let _ = cache.read(ROOTDEV, bn);
        }
        let b = cache.read(ROOTDEV, 3);
        assert_eq!(b[0], 0, "unpinned buffer survived eviction pressure");
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn exhaustion_panics() {
        let (cache, _disk) = cache_over(4 * NBUF as u32);
        let mut held = Vec::new();
        for bn in 0..NBUF as u32 {
            held.push(cache.read(ROOTDEV, bn));
        }
        // All slots referenced: the next distinct block has no victim.
        let _ = cache.read(ROOTDEV, NBUF as u32 + 1);
    }

    #[test]
    fn concurrent_readers_one_identity() {
        let (cache, _disk) = cache_over(64);
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let mut b = cache.read(ROOTDEV, 11);
                        let v = u32::from_le_bytes(b[0..4].try_into().unwrap());
                        b[0..4].copy_from_slice(&(v + 1).to_le_bytes());
                    }
                });
            }
        });
        // If two buffers ever carried the same identity, increments would
        // be lost to the stale copy.
        let b = cache.read(ROOTDEV, 11);
        let v = u32::from_le_bytes(b[0..4].try_into().unwrap());
        assert_eq!(v, (THREADS * ROUNDS) as u32);
    }

    #[test]
    fn concurrent_misses_all_complete() {
        let (cache, _disk) = cache_over(8 * NBUF as u32);
        let cache = &cache;
        std::thread::scope(|s| {
            for t in 0..6u32 {
                s.spawn(move || {
                    for _round in 0..4 {
                        for bn in 0..NBUF as u32 {
                            let b = cache.read(ROOTDEV, t * NBUF as u32 + bn);
                            assert_eq!(b.blockno(), t * NBUF as u32 + bn);
                        }
                    }
                });
            }
        });
    }
}
