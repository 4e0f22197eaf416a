//! Growable byte buffer
//!
//! Contiguous byte queue whose allocation always spans a whole number of
//! granularity units. Appends reclaim the consumed prefix and grow the
//! allocation in granule steps, consumes advance a head cursor, and a
//! compaction heuristic slides and shrinks the storage once the unconsumed
//! remainder gets small.
//!
//! Memory layout:
//! ```text
//! |<-- consumed -->|<-- data (len) -->|<-- tailroom -->|
//! 0                head               tail             storage.len()
//! ```

use std::fmt;

/// Default allocation granularity in bytes
pub const DEFAULT_GRANULARITY: usize = 1024;

/// Byte buffer that grows and shrinks in granularity units
pub struct GrowBuf {
    /// Backing storage; its length is the allocated capacity
    storage: Vec<u8>,
    /// Start of unconsumed data
    head: usize,
    /// End of unconsumed data
    tail: usize,
    /// Allocation step size in bytes
    granularity: usize,
}

impl GrowBuf {
    /// Create an empty buffer. No storage is allocated until the first
    /// append or reserve.
    pub fn new(granularity: usize) -> Self {
        assert!(granularity > 0, "granularity must be non-zero");
        GrowBuf {
            storage: Vec::new(),
            head: 0,
            tail: 0,
            granularity,
        }
    }

    /// Unconsumed byte count
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Allocated capacity in bytes, always a multiple of the granularity
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Unconsumed data as a slice
    pub fn data(&self) -> &[u8] {
        &self.storage[self.head..self.tail]
    }

    /// Free space between tail and the end of the allocation
    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.tail
    }

    /// Append bytes, growing the allocation in whole granules as needed
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let dst = self.reserve_tail(bytes.len());
        dst[..bytes.len()].copy_from_slice(bytes);
        self.advance_tail(bytes.len());
    }

    /// Ensure at least `min` writable bytes at the tail and return the whole
    /// free tail region. The consumed prefix is reclaimed before the
    /// allocation grows, which keeps storage proportional to unconsumed data
    /// instead of total throughput. Pair with `advance_tail` once bytes are
    /// written.
    pub fn reserve_tail(&mut self, min: usize) -> &mut [u8] {
        if self.tailroom() < min {
            if self.head > 0 {
                let len = self.len();
                self.storage.copy_within(self.head..self.tail, 0);
                self.head = 0;
                self.tail = len;
            }
            if self.tailroom() < min {
                let new_size = round_up(self.tail + min, self.granularity);
                self.storage.resize(new_size, 0);
            }
        }
        &mut self.storage[self.tail..]
    }

    /// Commit `n` bytes previously written into the reserved tail region
    pub fn advance_tail(&mut self, n: usize) {
        debug_assert!(self.tail + n <= self.storage.len(), "advance past allocation");
        self.tail = (self.tail + n).min(self.storage.len());
    }

    /// Remove up to `n` bytes from the front, returning how many were
    /// actually removed. Runs the compaction heuristic afterwards.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
        self.maybe_compact();
        n
    }

    /// Discard all unconsumed bytes
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.maybe_compact();
    }

    /// Slide the remainder to the front and release surplus granules.
    ///
    /// Triggers only when the remainder is smaller than one granule and the
    /// allocation spans more granules than the remainder needs, so a long
    /// drain does not compact on every consumed byte while a mostly-empty
    /// buffer still gives its storage back.
    fn maybe_compact(&mut self) {
        let len = self.len();
        if len >= self.granularity {
            return;
        }
        let have_units = self.storage.len() / self.granularity;
        let need_units = units_for(len.max(1), self.granularity);
        if need_units >= have_units {
            return;
        }
        self.storage.copy_within(self.head..self.tail, 0);
        self.head = 0;
        self.tail = len;
        self.storage.truncate(need_units * self.granularity);
        self.storage.shrink_to_fit();
    }
}

impl Default for GrowBuf {
    fn default() -> Self {
        GrowBuf::new(DEFAULT_GRANULARITY)
    }
}

impl fmt::Debug for GrowBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowBuf")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("granularity", &self.granularity)
            .finish()
    }
}

fn round_up(n: usize, granularity: usize) -> usize {
    units_for(n, granularity) * granularity
}

fn units_for(n: usize, granularity: usize) -> usize {
    (n + granularity - 1) / granularity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty_and_unallocated() {
        let buf = GrowBuf::new(1024);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.data(), &[] as &[u8]);
    }

    #[test]
    #[should_panic(expected = "granularity must be non-zero")]
    fn test_zero_granularity_panics() {
        let _ = GrowBuf::new(0);
    }

    #[test]
    fn test_append_and_data() {
        let mut buf = GrowBuf::new(64);
        buf.append(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.data(), &[1, 2, 3, 4, 5]);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_capacity_grows_in_whole_granules() {
        let mut buf = GrowBuf::new(16);
        buf.append(&[0u8; 10]);
        assert_eq!(buf.capacity(), 16);
        buf.append(&[0u8; 10]);
        assert_eq!(buf.capacity(), 32);
        buf.append(&[0u8; 100]);
        assert_eq!(buf.capacity(), 128);
    }

    #[test]
    fn test_consume_prefix() {
        let mut buf = GrowBuf::new(64);
        buf.append(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf.consume(3), 3);
        assert_eq!(buf.data(), &[4, 5, 6, 7, 8]);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_consume_clamps_to_len() {
        let mut buf = GrowBuf::new(64);
        buf.append(&[1, 2, 3]);
        assert_eq!(buf.consume(10), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consume_all_resets_cursors() {
        let mut buf = GrowBuf::new(64);
        buf.append(&[9u8; 40]);
        buf.consume(40);
        assert!(buf.is_empty());
        buf.append(&[1, 2]);
        assert_eq!(buf.data(), &[1, 2]);
    }

    #[test]
    fn test_compaction_shrinks_large_drained_buffer() {
        let mut buf = GrowBuf::new(1024);
        buf.append(&[7u8; 8000]);
        assert_eq!(buf.capacity(), 8192);
        // Drain down to a sub-granule remainder
        buf.consume(7500);
        assert_eq!(buf.len(), 500);
        assert_eq!(buf.data(), &[7u8; 500]);
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn test_no_compaction_while_remainder_large() {
        let mut buf = GrowBuf::new(1024);
        buf.append(&[7u8; 8000]);
        buf.consume(1000);
        // 7000 bytes remain, more than one granule: capacity untouched
        assert_eq!(buf.capacity(), 8192);
        assert_eq!(buf.len(), 7000);
    }

    #[test]
    fn test_compaction_preserves_bytes() {
        let mut buf = GrowBuf::new(16);
        let payload: Vec<u8> = (0..200u8).collect();
        buf.append(&payload);
        buf.consume(190);
        assert_eq!(buf.data(), &payload[190..]);
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_clear_discards_and_shrinks() {
        let mut buf = GrowBuf::new(1024);
        buf.append(&[1u8; 5000]);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn test_reserve_tail_and_advance() {
        let mut buf = GrowBuf::new(32);
        let space = buf.reserve_tail(10);
        assert!(space.len() >= 10);
        space[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.advance_tail(4);
        assert_eq!(buf.data(), &[1, 2, 3, 4]);
        assert_eq!(buf.capacity(), 32);
    }

    #[test]
    fn test_append_after_partial_consume() {
        let mut buf = GrowBuf::new(16);
        buf.append(b"hello world");
        buf.consume(6);
        buf.append(b"!!!");
        assert_eq!(buf.data(), b"world!!!");
    }

    #[test]
    fn test_steady_state_backlog_keeps_capacity_bounded() {
        let mut buf = GrowBuf::new(1024);
        // Consumer stays a fixed 2048 bytes behind the producer, so the
        // remainder never drops below one granule and never shrink-compacts
        buf.append(&[0u8; 2048]);
        let mut peak = buf.capacity();
        for _ in 0..10_000 {
            buf.append(&[0u8; 100]);
            buf.consume(100);
            peak = peak.max(buf.capacity());
        }
        assert_eq!(buf.len(), 2048);
        assert!(
            peak <= 4096,
            "allocation reached {} bytes for at most 2148 live",
            peak
        );
    }

    // Property-based tests
    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Property 1: Capacity is always a whole number of granules
            /// and never smaller than the unconsumed length
            #[test]
            fn prop_capacity_invariant(
                granularity in 1..512usize,
                appends in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 0..10)
            ) {
                let mut buf = GrowBuf::new(granularity);
                for chunk in &appends {
                    buf.append(chunk);
                    prop_assert_eq!(buf.capacity() % granularity, 0);
                    prop_assert!(buf.capacity() >= buf.len());
                }
            }

            /// Property 2: Interleaved appends and consumes behave like a
            /// simple byte queue
            #[test]
            fn prop_matches_model_queue(
                granularity in 1..128usize,
                ops in prop::collection::vec(
                    prop_oneof![
                        prop::collection::vec(any::<u8>(), 1..50).prop_map(Op::Append),
                        (0..80usize).prop_map(Op::Consume),
                    ],
                    0..30
                )
            ) {
                let mut buf = GrowBuf::new(granularity);
                let mut model: Vec<u8> = Vec::new();
                for op in &ops {
                    match op {
                        Op::Append(bytes) => {
                            buf.append(bytes);
                            model.extend_from_slice(bytes);
                        }
                        Op::Consume(n) => {
                            let taken = buf.consume(*n);
                            let expect = (*n).min(model.len());
                            prop_assert_eq!(taken, expect);
                            model.drain(..expect);
                        }
                    }
                    prop_assert_eq!(buf.data(), model.as_slice());
                    prop_assert_eq!(buf.len(), model.len());
                }
            }

            /// Property 3: Compaction never loses or reorders bytes
            #[test]
            fn prop_compaction_no_loss(
                granularity in 1..64usize,
                payload in prop::collection::vec(any::<u8>(), 1..400),
                eat in 0..400usize
            ) {
                let mut buf = GrowBuf::new(granularity);
                buf.append(&payload);
                let eat = eat.min(payload.len());
                buf.consume(eat);
                prop_assert_eq!(buf.data(), &payload[eat..]);
            }

            /// Property 4: reserve_tail always yields at least the requested
            /// room and leaves existing data intact
            #[test]
            fn prop_reserve_tail_room(
                granularity in 1..128usize,
                seed in prop::collection::vec(any::<u8>(), 0..100),
                want in 1..300usize
            ) {
                let mut buf = GrowBuf::new(granularity);
                buf.append(&seed);
                let room = buf.reserve_tail(want).len();
                prop_assert!(room >= want);
                prop_assert_eq!(buf.data(), seed.as_slice());
            }

            /// Property 5: The allocation never exceeds the high-water mark
            /// of unconsumed data rounded up to whole granules
            #[test]
            fn prop_capacity_bounded_by_high_water(
                granularity in 1..256usize,
                ops in prop::collection::vec(
                    prop_oneof![
                        prop::collection::vec(any::<u8>(), 1..100).prop_map(Op::Append),
                        (0..120usize).prop_map(Op::Consume),
                    ],
                    1..60
                )
            ) {
                let mut buf = GrowBuf::new(granularity);
                let mut high_water = 1usize;
                for op in &ops {
                    match op {
                        Op::Append(bytes) => buf.append(bytes),
                        Op::Consume(n) => {
                            buf.consume(*n);
                        }
                    }
                    high_water = high_water.max(buf.len());
                    prop_assert!(buf.capacity() <= round_up(high_water, granularity));
                }
            }
        }

        #[derive(Debug, Clone)]
        enum Op {
            Append(Vec<u8>),
            Consume(usize),
        }
    }
}
