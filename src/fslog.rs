// Simple logging that allows concurrent FS operations.
//
// A log transaction contains the updates of multiple FS operations. The
// logging system only commits when there are no FS operations active.
// Thus there is never any reasoning required about whether a commit
// might write an uncommitted operation's updates to disk.
//
// An operation should call begin_op()/end_op() to mark its start and
// end. Usually begin_op() just increments the count of in-progress
// operations and returns. But if it thinks the log is close to running
// out, it sleeps until the last outstanding end_op() commits.
//
// The log is a physical re-do log containing disk blocks. The on-disk
// format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.
//
// Writing the header is the commit point: before it, a crash discards
// every payload in the log region; after it, recovery replays them all.

use crate::bio::{BCache, BufGuard};
use crate::fs::{SuperBlock, BSIZE};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::sync::{Condvar, SpinLock};
use core::mem::size_of;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

// Contents of the header block, used both for the on-disk header and to
// keep track in memory of logged block #s before commit.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(size_of::<LogHeader>() <= BSIZE);

struct LogState {
    start: u32,
    size: u32,
    outstanding: u32,
    committing: bool,
    lh: LogHeader,
}

pub struct Log {
    dev: u32,
    state: SpinLock<LogState>,
    cond: Condvar,
}

impl Log {
    /// Set up the log over `sb`'s log region and replay anything a crash
    /// left committed but not installed.
    pub fn new(dev: u32, sb: &SuperBlock, cache: &BCache) -> Self {
        assert!(sb.nlog > 1, "log region too small");
        let log = Self {
            dev,
            state: SpinLock::new(
                LogState {
                    start: sb.logstart,
                    size: sb.nlog,
                    outstanding: 0,
                    committing: false,
                    lh: LogHeader {
                        n: 0,
                        block: [0; LOGSIZE],
                    },
                },
                "log",
            ),
            cond: Condvar::new(),
        };
        log.recover(cache);
        log
    }

    fn recover(&self, cache: &BCache) {
        let start = self.state.lock().start;
        let lh = self.read_head(cache, start);
        if lh.n > 0 {
            log::info!("recovering {} committed blocks from the log", lh.n);
        }
        self.install_trans(cache, &lh, start, true);
        let cleared = {
            let mut state = self.state.lock();
            state.lh = lh;
            state.lh.n = 0;
            state.lh
        };
        self.write_head(cache, &cleared, start);
    }

    /// Read the log header from disk into memory.
    fn read_head(&self, cache: &BCache, start: u32) -> LogHeader {
        let buf = cache.read(self.dev, start);
        LogHeader::read_from(&buf[..size_of::<LogHeader>()]).unwrap()
    }

    /// Write the in-memory log header to disk. This is the true point at
    /// which the current transaction commits.
    fn write_head(&self, cache: &BCache, lh: &LogHeader, start: u32) {
        let mut buf = cache.read(self.dev, start);
        buf[..size_of::<LogHeader>()].copy_from_slice(lh.as_bytes());
        buf.write();
    }

    /// Copy committed blocks from the log region to their home locations.
    fn install_trans(&self, cache: &BCache, lh: &LogHeader, start: u32, recovering: bool) {
        for tail in 0..lh.n {
            let lbuf = cache.read(self.dev, start + tail + 1);
            let mut dbuf = cache.read(self.dev, lh.block[tail as usize]);
            dbuf.copy_from_slice(&lbuf[..]);
            dbuf.write();
            if !recovering {
                dbuf.unpin();
            }
        }
    }

    /// Copy modified blocks from the cache to the log region.
    fn write_log(&self, cache: &BCache, lh: &LogHeader, start: u32) {
        for tail in 0..lh.n {
            let from = cache.read(self.dev, lh.block[tail as usize]);
            let mut to = cache.read(self.dev, start + tail + 1);
            to.copy_from_slice(&from[..]);
            to.write();
        }
    }

    fn commit(&self, cache: &BCache) {
        // `committing` excludes every writer, so the header copied out
        // here cannot change until we clear it below.
        let (lh, start) = {
            let state = self.state.lock();
            (state.lh, state.start)
        };
        if lh.n > 0 {
            self.write_log(cache, &lh, start); // modified blocks, cache -> log
            self.write_head(cache, &lh, start); // the real commit
            self.install_trans(cache, &lh, start, false); // log -> home locations
            let cleared = {
                let mut state = self.state.lock();
                state.lh.n = 0;
                state.lh
            };
            self.write_head(cache, &cleared, start); // erase the transaction
        }
    }

    /// Called at the start of each FS operation.
    pub fn begin_op(&self) {
        let mut state = self.state.lock();
        loop {
            if state.committing {
                state = self.cond.wait(state);
            } else if state.lh.n as usize + (state.outstanding as usize + 1) * MAXOPBLOCKS
                > LOGSIZE
            {
                // This op might exhaust log space; wait for commit.
                state = self.cond.wait(state);
            } else {
                state.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS operation; commits if this was the
    /// last outstanding operation.
    pub fn end_op(&self, cache: &BCache) {
        let do_commit = {
            let mut state = self.state.lock();
            assert!(state.outstanding > 0, "end_op outside of transaction");
            state.outstanding -= 1;
            assert!(!state.committing, "end_op while committing");
            if state.outstanding == 0 {
                state.committing = true;
                true
            } else {
                // begin_op() may be waiting for log space, and decrementing
                // outstanding has decreased the amount of reserved space.
                false
            }
        };

        if do_commit {
            // Commit without holding the lock, since sleeping with it held
            // is not allowed.
            self.commit(cache);
            let mut state = self.state.lock();
            state.committing = false;
        }
        self.cond.notify_all();
    }

    /// Record that `b` belongs to the current transaction and pin it in
    /// the cache until commit installs it. Replaces a bare write: a
    /// typical use is
    ///   let mut bp = cache.read(dev, bn);
    ///   // modify bp[..]
    ///   log.write(bp);
    pub fn write(&self, b: BufGuard<'_>) {
        let mut state = self.state.lock();
        if state.lh.n as usize >= LOGSIZE || state.lh.n + 1 >= state.size {
            panic!("too big a transaction");
        }
        if state.outstanding < 1 {
            panic!("log write outside of transaction");
        }

        let blockno = b.blockno();
        let n = state.lh.n as usize;
        if !state.lh.block[..n].contains(&blockno) {
            // Not absorbed: claim a slot and keep the buffer resident.
            b.pin();
            state.lh.block[n] = blockno;
            state.lh.n += 1;
        }
    }

    /// Number of blocks the open transaction has claimed so far.
    #[cfg(test)]
    pub(crate) fn n_logged(&self) -> usize {
        self.state.lock().lh.n as usize
    }
}
