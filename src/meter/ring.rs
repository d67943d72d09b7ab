//! Fixed-size ring of time buckets.

use std::time::Duration;

/// One measurement bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Bucket {
    /// Offset from the measurement start; always a multiple of the resolution
    pub start: Duration,
    /// Offset from the measurement start at which this bucket closes
    pub end: Duration,
    /// Bytes recorded into this bucket
    pub volume: u64,
}

/// A circular arena of buckets addressed by index.
///
/// `cur` is the open bucket. `last` is the most recently closed one and
/// `first` the oldest bucket still holding data; both stay `None` until the
/// first bucket closes.
#[derive(Debug)]
pub(crate) struct BucketRing {
    buckets: Vec<Bucket>,
    cur: usize,
    last: Option<usize>,
    first: Option<usize>,
}

impl BucketRing {
    pub fn new(len: usize) -> Self {
        debug_assert!(len >= 2);
        Self {
            buckets: vec![Bucket::default(); len],
            cur: 0,
            last: None,
            first: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn cur(&self) -> &Bucket {
        &self.buckets[self.cur]
    }

    pub fn cur_mut(&mut self) -> &mut Bucket {
        &mut self.buckets[self.cur]
    }

    pub fn cur_index(&self) -> usize {
        self.cur
    }

    pub fn last(&self) -> Option<usize> {
        self.last
    }

    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.buckets.len()
    }

    fn prev(&self, idx: usize) -> usize {
        (idx + self.buckets.len() - 1) % self.buckets.len()
    }

    /// Close the open bucket and reuse the next slot as the new open bucket.
    ///
    /// Exactly one slot is advanced no matter how much time has passed.
    pub fn advance(&mut self, start: Duration, end: Duration, volume: u64) {
        let closed = self.cur;
        self.last = Some(closed);
        self.cur = self.next(closed);

        match self.first {
            None => self.first = Some(closed),
            Some(first) if first == self.cur => self.first = Some(self.next(first)),
            Some(_) => {}
        }

        self.buckets[self.cur] = Bucket { start, end, volume };
    }

    /// Sum the volumes walking backward from `newest` while bucket starts are
    /// at or after `window_start`, stopping at the oldest filled bucket.
    pub fn sum_since(&self, newest: usize, window_start: Duration) -> u64 {
        let mut sum = 0;
        let mut idx = newest;
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[idx];
            if bucket.start < window_start {
                break;
            }
            sum += bucket.volume;
            if Some(idx) == self.first {
                break;
            }
            idx = self.prev(idx);
        }
        sum
    }
}
