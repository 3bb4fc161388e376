//! Replay tracker: records which message numbers within one segment have
//! already been accepted, in bounded memory, with precision dominated by
//! recency.
//!
//! # Representation
//!
//! A ring of `k` blocks of [`MessageTracker::BLOCK_SIZE`] booleans
//! (`1 <= k <= MAX_BLOCKS`) covers the message numbers
//! `[base_msgnum, base_msgnum + k * BLOCK_SIZE)`. The block starting at ring
//! position `current_block * BLOCK_SIZE` corresponds to `base_msgnum`; ring
//! indexing wraps modulo `k * BLOCK_SIZE`. Each block additionally records how
//! many of its slots are set and when it was last written.
//!
//! Message numbers below the window are conservatively reported as seen: any
//! record of them has been discarded, and such a message would be rejected
//! anyway. Logging a message number above the window advances it by whole
//! blocks. Blocks whose records would be discarded are given up freely when
//! they are full or have not been written within the current round-trip
//! estimate; otherwise the ring grows (up to `MAX_BLOCKS` blocks) so that
//! still-in-flight reordered packets keep their exact records.
//!
//! # Precision contract
//!
//! There is a message number `msgnum_bound` (which can only increase, at a
//! `log` call) such that for all `m >= msgnum_bound`, `seen(m)` is true if and
//! only if `m` has been logged. With `x` the smallest multiple of `BLOCK_SIZE`
//! strictly greater than the highest logged number, `y = x - BLOCK_SIZE *
//! MAX_BLOCKS`, and `z` the smallest logged number that is `>= y` and was
//! logged within one round-trip estimate of the highest, `msgnum_bound` is the
//! greatest multiple of `BLOCK_SIZE` that is `<= z`.

use std::cmp::min;
use std::sync::Arc;

use crate::epoch::epoch_millis;
use crate::rtt::RttTracker;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
struct BlockRecord {
    /// Number of slots in this block that have been set.
    logged: u32,
    /// Timestamp (epoch millis) of the most recent `log` into this block.
    last_logged_at: u64,
}

pub struct MessageTracker {
    rtt_tracker: Arc<RttTracker>,
    block_records: Vec<BlockRecord>,
    msg_records: Vec<bool>,
    /// Ring index of the block corresponding to `base_msgnum`.
    current_block: usize,
    /// Message number mapped to the first slot of the ring.
    base_msgnum: u64,
}

impl MessageTracker {
    /// Slots per block. Public because the precision contract above is
    /// phrased in terms of it.
    pub const BLOCK_SIZE: usize = 256;
    /// Upper bound on the number of blocks the ring may grow to.
    pub const MAX_BLOCKS: usize = 64;

    pub fn new(rtt_tracker: Arc<RttTracker>) -> MessageTracker {
        MessageTracker {
            rtt_tracker,
            block_records: vec![BlockRecord::default()],
            msg_records: vec![false; Self::BLOCK_SIZE],
            current_block: 0,
            base_msgnum: 0,
        }
    }

    /// Forgets everything, ready for a fresh segment. The ring keeps whatever
    /// capacity it has grown to.
    pub fn reset(&mut self) {
        self.msg_records.fill(false);
        self.block_records.fill(BlockRecord::default());
        self.current_block = 0;
        self.base_msgnum = 0;
    }

    /// Whether `msgnum` has been seen. Guaranteed true for every logged
    /// number; may also be true for unlogged numbers that have fallen below
    /// the window (see the precision contract in the module docs).
    pub fn seen(&self, msgnum: u64) -> bool {
        if msgnum < self.base_msgnum {
            return true;
        }
        if msgnum >= self.base_msgnum + self.msg_records.len() as u64 {
            return false;
        }
        self.msg_records[self.records_pos(msgnum)]
    }

    /// Records `msgnum` as seen, advancing (and possibly growing) the window
    /// if the number lies above it. A number below the window is a no-op.
    pub fn log(&mut self, msgnum: u64) {
        if msgnum < self.base_msgnum {
            return;
        }

        let now = epoch_millis();

        if msgnum >= self.base_msgnum + self.msg_records.len() as u64 {
            let blocks_forward = (msgnum - (self.base_msgnum + self.msg_records.len() as u64))
                / Self::BLOCK_SIZE as u64
                + 1;
            let extra_blocks = self.how_many_extra_blocks(
                blocks_forward,
                now,
                self.rtt_tracker.current_rtt() as u64,
            );

            if extra_blocks == 0 {
                self.slide_window(blocks_forward);
            } else {
                self.grow_and_copy(blocks_forward, extra_blocks);
            }
        }

        let pos = self.records_pos(msgnum);
        self.msg_records[pos] = true;
        let record = &mut self.block_records[pos / Self::BLOCK_SIZE];
        record.logged += 1;
        record.last_logged_at = now;
    }

    /// Ring position of `msgnum`'s record. Assumes `msgnum` lies inside the
    /// window.
    fn records_pos(&self, msgnum: u64) -> usize {
        let msgnum_offset = msgnum - self.base_msgnum;
        let ring_offset = (Self::BLOCK_SIZE * self.current_block) as u64;
        ((msgnum_offset + ring_offset) % self.msg_records.len() as u64) as usize
    }

    /// How many blocks the ring should grow by for a window move of
    /// `blocks_forward` blocks. Zero means slide in place.
    ///
    /// Scans the blocks that the move would discard; the first one that is
    /// neither full nor stale (written within the current round-trip
    /// estimate) is worth keeping, and the ring grows just enough to retain
    /// it and everything after it, capped at `MAX_BLOCKS` total.
    fn how_many_extra_blocks(&self, blocks_forward: u64, now: u64, rtt: u64) -> usize {
        let len = self.block_records.len();
        if len == Self::MAX_BLOCKS {
            return 0;
        }

        let scan_limit = min(len as u64, blocks_forward);
        let mut first_worth_keeping = 0u64;
        while first_worth_keeping < scan_limit {
            let record =
                &self.block_records[(first_worth_keeping as usize + self.current_block) % len];
            if (record.logged as usize) < Self::BLOCK_SIZE
                && now.saturating_sub(record.last_logged_at) <= rtt
            {
                break;
            }
            first_worth_keeping += 1;
        }

        let wanted = blocks_forward - first_worth_keeping;
        min(wanted, (Self::MAX_BLOCKS - len) as u64) as usize
    }

    /// Advances the window by `blocks_forward` blocks, reusing the ring in
    /// place. The blocks passed over are cleared for reuse.
    fn slide_window(&mut self, blocks_forward: u64) {
        let len = self.block_records.len();
        let blocks_to_reset = min(len as u64, blocks_forward) as usize;

        for i in 0..blocks_to_reset {
            let block = (i + self.current_block) % len;
            self.block_records[block] = BlockRecord::default();
            self.msg_records[block * Self::BLOCK_SIZE..(block + 1) * Self::BLOCK_SIZE]
                .fill(false);
        }

        self.current_block =
            ((self.current_block as u64 + blocks_forward) % len as u64) as usize;
        self.base_msgnum += blocks_forward * Self::BLOCK_SIZE as u64;
    }

    /// Advances the window by `blocks_forward` blocks while growing the ring
    /// by `extra_blocks`, copying the blocks that survive the move so that
    /// the first retained block lands at ring index 0.
    fn grow_and_copy(&mut self, blocks_forward: u64, extra_blocks: usize) {
        let old_len = self.block_records.len();
        let new_len = old_len + extra_blocks;
        let mut new_msg_records = vec![false; new_len * Self::BLOCK_SIZE];
        let mut new_block_records = vec![BlockRecord::default(); new_len];

        let blocks_discarded = blocks_forward - extra_blocks as u64;
        let blocks_to_copy = if blocks_discarded > old_len as u64 {
            0
        } else {
            old_len - blocks_discarded as usize
        };
        let first_retained =
            ((self.current_block as u64 + blocks_discarded) % old_len as u64) as usize;

        for i in 0..blocks_to_copy {
            let src = (first_retained + i) % old_len;
            new_block_records[i] = self.block_records[src];
            new_msg_records[i * Self::BLOCK_SIZE..(i + 1) * Self::BLOCK_SIZE].copy_from_slice(
                &self.msg_records[src * Self::BLOCK_SIZE..(src + 1) * Self::BLOCK_SIZE],
            );
        }

        self.msg_records = new_msg_records;
        self.block_records = new_block_records;
        self.current_block = 0;
        self.base_msgnum += blocks_discarded * Self::BLOCK_SIZE as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BLOCK_SIZE: u64 = MessageTracker::BLOCK_SIZE as u64;
    const MAX_BLOCKS: u64 = MessageTracker::MAX_BLOCKS as u64;

    /// An RTT estimate of one hour makes every block count as recently
    /// written, so window moves always prefer growing over discarding.
    fn tracker_with_long_rtt() -> MessageTracker {
        let rtt_tracker = Arc::new(RttTracker::new());
        rtt_tracker.update_rtt(3_600_000);
        MessageTracker::new(rtt_tracker)
    }

    #[test]
    fn test_few_msgnums_logged_and_recalled() {
        let mut tracker = tracker_with_long_rtt();

        let nums: Vec<u64> = vec![
            0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
            15, 17, 19, 20, 21, 24, 25,
            50, 55, 56, 61, 62, 63, 68, 70, 73, 74, 75, 79, 80,
            100, 200, 500, 1000, 1001, 2000, 2002,
            4999, 5000, 5001, 5002,
            20000, 20001, 20002, 60000, 60001, 60002,
            1 << 20,
            1 << 25,
            1 << 30,
            1 << 35,
            1 << 40,
            1 << 45,
            (1 << 48) - 1, // maximum message number
        ];

        for &n in &nums {
            assert!(!tracker.seen(n));
        }
        for &n in &nums {
            assert!(!tracker.seen(n));
            tracker.log(n);
            assert!(tracker.seen(n));
        }
        for &n in &nums {
            assert!(tracker.seen(n));
        }
    }

    #[test]
    fn test_dense_range() {
        let mut tracker = tracker_with_long_rtt();
        let length = 1_000_000u64;

        for n in 0..length {
            assert!(!tracker.seen(n));
        }
        for n in 0..length {
            assert!(!tracker.seen(n));
            tracker.log(n);
            assert!(tracker.seen(n));
        }
        for n in 0..length {
            assert!(tracker.seen(n));
        }
    }

    #[test]
    fn test_out_of_order_logging() {
        let mut tracker = tracker_with_long_rtt();

        let nums: Vec<u64> = vec![
            1000, 990, 1011, 999, 1005, 1031, 991, 992, 993, 1007,
            1027, 985, 1026, 984, 986, 1001, 1002, 997, 1030, 998,
        ];

        for &n in &nums {
            assert!(!tracker.seen(n));
        }
        for &n in &nums {
            tracker.log(n);
            assert!(tracker.seen(n));
        }
        for &n in &nums {
            assert!(tracker.seen(n));
        }
    }

    #[test]
    fn test_sparse_multiples_over_large_range() {
        let mut tracker = tracker_with_long_rtt();

        let nums: Vec<u64> = (1..106_000)
            .filter(|i| i % 3 == 0 || i % 5 == 0 || i % 7 == 0)
            .collect();

        for &n in &nums {
            assert!(!tracker.seen(n));
        }
        for &n in &nums {
            tracker.log(n);
            assert!(tracker.seen(n));
        }
        for &n in &nums {
            assert!(tracker.seen(n));
        }
    }

    /// Inside the window described by the precision contract, `seen` must
    /// answer exactly: true if and only if the number was logged. This drives
    /// the tracker through growth, boundary positions and a window move while
    /// checking the whole window after every batch.
    #[test]
    fn test_exact_results_within_window() {
        let mut tracker = tracker_with_long_rtt();
        let mut logged: HashSet<u64> = HashSet::new();

        // window parameters straight from the precision contract
        let msgnum_highest = (MAX_BLOCKS + 1) * BLOCK_SIZE + MAX_BLOCKS / 2;
        let x = (MAX_BLOCKS + 2) * BLOCK_SIZE;
        let y = x - BLOCK_SIZE * MAX_BLOCKS;
        let z = y + MAX_BLOCKS / 2;
        let mut msgnum_bound = y;
        let mut range_limit = x;

        fn check_whole_window(
            tracker: &MessageTracker,
            logged: &HashSet<u64>,
            msgnum_bound: u64,
            range_limit: u64,
        ) {
            for n in msgnum_bound..(range_limit + BLOCK_SIZE) {
                assert_eq!(tracker.seen(n), logged.contains(&n), "msgnum {}", n);
            }
        }

        fn log_all(tracker: &mut MessageTracker, logged: &mut HashSet<u64>, nums: &[u64]) {
            for &n in nums {
                if logged.insert(n) {
                    assert!(!tracker.seen(n));
                    tracker.log(n);
                    assert!(tracker.seen(n));
                }
            }
        }

        // logging these two numbers establishes the intended window state
        log_all(&mut tracker, &mut logged, &[z, msgnum_highest]);
        check_whole_window(&tracker, &logged, msgnum_bound, range_limit);

        // spread batches of multiples through the window
        for f in [619, 103, 309, 71, 19, 17, 7, 499] {
            let batch: Vec<u64> = (msgnum_bound + 15..range_limit - 15)
                .filter(|n| n % f == 0)
                .collect();
            log_all(&mut tracker, &mut logged, &batch);
            check_whole_window(&tracker, &logged, msgnum_bound, range_limit);
        }

        // both ends of the window
        let end_nums = [
            msgnum_bound, range_limit - 1, msgnum_bound + 1, range_limit - 2,
            msgnum_bound + 7, msgnum_bound + 5, range_limit - 8, range_limit - 6,
            msgnum_bound + 10, range_limit - 13, msgnum_bound + 12, range_limit - 11,
        ];
        log_all(&mut tracker, &mut logged, &end_nums);
        check_whole_window(&tracker, &logged, msgnum_bound, range_limit);

        // everything must still be recalled exactly after the window moves on
        let block_offset = BLOCK_SIZE * 3;
        log_all(&mut tracker, &mut logged, &[msgnum_highest + block_offset]);
        msgnum_bound += block_offset;
        range_limit += block_offset;
        check_whole_window(&tracker, &logged, msgnum_bound, range_limit);
    }

    /// Two consecutive `seen` calls answer the same unless a log above the
    /// current highest intervenes.
    #[test]
    fn test_seen_is_stable_without_higher_log() {
        let mut tracker = tracker_with_long_rtt();

        for n in [100u64, 700, 3000] {
            tracker.log(n);
        }
        for n in 0..4000u64 {
            assert_eq!(tracker.seen(n), tracker.seen(n));
        }

        // logging below the highest must not change any answer
        let before: Vec<bool> = (0..4000).map(|n| tracker.seen(n)).collect();
        tracker.log(200);
        tracker.log(2999);
        for (n, was_seen) in before.iter().enumerate() {
            let n = n as u64;
            if n == 200 || n == 2999 {
                assert!(tracker.seen(n));
            } else {
                assert_eq!(tracker.seen(n), *was_seen);
            }
        }
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut tracker = tracker_with_long_rtt();

        for n in 0..(BLOCK_SIZE * 10) {
            tracker.log(n);
            assert!(tracker.seen(n));
        }

        tracker.reset();

        for n in 0..(BLOCK_SIZE * 10) {
            assert!(!tracker.seen(n));
        }
    }
}
