//! PRB/RBG Bitmaps and Interval Arithmetic
//!
//! Fixed-capacity bitsets for resource block occupancy and the interval searches
//! used by every frequency-domain allocation. A set bit means "used".

use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Maximum number of PRBs in a carrier (TS 38.101 275 PRB limit)
pub const MAX_NOF_PRBS: usize = 275;
/// Maximum number of RBGs for allocation type 0
pub const MAX_NOF_RBGS: usize = 18;
/// Maximum number of CCEs in a CORESET (275 RBs x 3 symbols / 6 REGs)
pub const MAX_NOF_CCES: usize = 137;

const WORD_BITS: usize = 64;

/// Fixed-capacity bitmap whose length is chosen at construction.
///
/// Bits at or beyond [`ResourceBitmap::size`] are always zero; every mutating
/// operation asserts its indices lie within the configured size.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBitmap<const WORDS: usize> {
    words: [u64; WORDS],
    size: usize,
}

/// PRB occupancy bitmap
pub type PrbBitmap = ResourceBitmap<5>;
/// RBG bitmap for allocation type 0
pub type RbgBitmap = ResourceBitmap<1>;
/// CCE occupancy bitmap of a CORESET
pub type CceBitmap = ResourceBitmap<3>;

impl<const WORDS: usize> ResourceBitmap<WORDS> {
    /// Number of bits this bitmap type can hold
    pub const CAPACITY: usize = WORDS * WORD_BITS;

    /// Create an all-zero bitmap of `size` bits
    pub fn new(size: usize) -> Self {
        assert!(size <= Self::CAPACITY, "bitmap size {} exceeds capacity {}", size, Self::CAPACITY);
        Self { words: [0; WORDS], size }
    }

    /// Create a bitmap with the bits of `interval` set
    pub fn from_interval(size: usize, interval: PrbInterval) -> Self {
        let mut bitmap = Self::new(size);
        bitmap.fill(interval.start(), interval.stop());
        bitmap
    }

    /// Configured length in bits
    pub fn size(&self) -> usize {
        self.size
    }

    /// Test bit `index`
    pub fn test(&self, index: usize) -> bool {
        assert!(index < self.size, "bit index {} out of bounds ({})", index, self.size);
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Set bit `index`
    pub fn set(&mut self, index: usize) {
        assert!(index < self.size, "bit index {} out of bounds ({})", index, self.size);
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    /// Clear bit `index`
    pub fn reset(&mut self, index: usize) {
        assert!(index < self.size, "bit index {} out of bounds ({})", index, self.size);
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
    }

    /// Set bit `index` to `value`
    pub fn assign(&mut self, index: usize, value: bool) {
        if value {
            self.set(index);
        } else {
            self.reset(index);
        }
    }

    /// Set all bits in `[start, end)`
    pub fn fill(&mut self, start: usize, end: usize) {
        self.fill_with(start, end, true);
    }

    /// Clear all bits in `[start, end)`
    pub fn reset_range(&mut self, start: usize, end: usize) {
        self.fill_with(start, end, false);
    }

    fn fill_with(&mut self, start: usize, end: usize, value: bool) {
        assert!(start <= end && end <= self.size, "invalid range [{}, {}) for size {}", start, end, self.size);
        for index in start..end {
            let mask = 1u64 << (index % WORD_BITS);
            if value {
                self.words[index / WORD_BITS] |= mask;
            } else {
                self.words[index / WORD_BITS] &= !mask;
            }
        }
    }

    /// Clear every bit
    pub fn reset_all(&mut self) {
        self.words = [0; WORDS];
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether any bit is set
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    /// Whether no bit is set
    pub fn none(&self) -> bool {
        !self.any()
    }

    /// Whether every bit within the configured size is set
    pub fn all(&self) -> bool {
        self.count() == self.size
    }

    /// Whether any bit in `[start, end)` is set
    pub fn any_in(&self, start: usize, end: usize) -> bool {
        self.find_lowest(start, end, true).is_some()
    }

    /// Whether every bit in `[start, end)` is set
    pub fn all_in(&self, start: usize, end: usize) -> bool {
        self.find_lowest(start, end, false).is_none()
    }

    /// Lowest index in `[start, end)` whose bit equals `value`
    pub fn find_lowest(&self, start: usize, end: usize, value: bool) -> Option<usize> {
        assert!(start <= end && end <= self.size, "invalid range [{}, {}) for size {}", start, end, self.size);
        let mut pos = start;
        while pos < end {
            let word_idx = pos / WORD_BITS;
            let mut word = if value { self.words[word_idx] } else { !self.words[word_idx] };
            word &= !0u64 << (pos % WORD_BITS);
            if word != 0 {
                let index = word_idx * WORD_BITS + word.trailing_zeros() as usize;
                return (index < end).then_some(index);
            }
            pos = (word_idx + 1) * WORD_BITS;
        }
        None
    }

    /// Iterate over the indices of set bits in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |i| self.test(*i))
    }

    fn check_same_size(&self, other: &Self) {
        assert_eq!(self.size, other.size, "bitmap size mismatch");
    }

    fn tail_mask(&self) -> [u64; WORDS] {
        let mut mask = [0u64; WORDS];
        for (i, m) in mask.iter_mut().enumerate() {
            let lo = i * WORD_BITS;
            if self.size >= lo + WORD_BITS {
                *m = !0;
            } else if self.size > lo {
                *m = (1u64 << (self.size - lo)) - 1;
            }
        }
        mask
    }
}

impl<const WORDS: usize> BitOr for ResourceBitmap<WORDS> {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        self |= rhs;
        self
    }
}

impl<const WORDS: usize> BitOrAssign for ResourceBitmap<WORDS> {
    fn bitor_assign(&mut self, rhs: Self) {
        self.check_same_size(&rhs);
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a |= *b;
        }
    }
}

impl<const WORDS: usize> BitAnd for ResourceBitmap<WORDS> {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        self &= rhs;
        self
    }
}

impl<const WORDS: usize> BitAndAssign for ResourceBitmap<WORDS> {
    fn bitand_assign(&mut self, rhs: Self) {
        self.check_same_size(&rhs);
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= *b;
        }
    }
}

impl<const WORDS: usize> Not for ResourceBitmap<WORDS> {
    type Output = Self;

    fn not(mut self) -> Self {
        let mask = self.tail_mask();
        for (w, m) in self.words.iter_mut().zip(mask.iter()) {
            *w = !*w & *m;
        }
        self
    }
}

impl<const WORDS: usize> fmt::Display for ResourceBitmap<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.size {
            f.write_str(if self.test(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl<const WORDS: usize> fmt::Debug for ResourceBitmap<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceBitmap({}: {})", self.size, self)
    }
}

impl<const WORDS: usize> Serialize for ResourceBitmap<WORDS> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Half-open interval `[start, stop)` of resource block (or RBG) indices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct PrbInterval {
    start: usize,
    stop: usize,
}

impl PrbInterval {
    /// Create a new interval
    pub fn new(start: usize, stop: usize) -> Self {
        assert!(start <= stop, "invalid interval [{}, {})", start, stop);
        Self { start, stop }
    }

    /// First index
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last index
    pub fn stop(&self) -> usize {
        self.stop
    }

    /// Number of indices covered
    pub fn length(&self) -> usize {
        self.stop - self.start
    }

    /// Whether the interval is empty
    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Whether `index` falls inside the interval
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.stop
    }

    /// Whether two non-empty intervals share an index
    pub fn overlaps(&self, other: &PrbInterval) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.stop && other.start < self.stop
    }

    /// Intersection, empty if the intervals are disjoint
    pub fn intersect(&self, other: &PrbInterval) -> PrbInterval {
        let start = self.start.max(other.start);
        let stop = self.stop.min(other.stop);
        if start >= stop {
            PrbInterval::default()
        } else {
            PrbInterval::new(start, stop)
        }
    }
}

impl fmt::Display for PrbInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// First maximal run of unused bits within `[start, end)`.
///
/// Returns an empty interval when every bit in the range is used.
pub fn find_next_empty_interval<const WORDS: usize>(
    used: &ResourceBitmap<WORDS>,
    start: usize,
    end: usize,
) -> PrbInterval {
    let end = end.min(used.size());
    if start >= end {
        return PrbInterval::default();
    }
    match used.find_lowest(start, end, false) {
        Some(first_free) => {
            let stop = used.find_lowest(first_free, end, true).unwrap_or(end);
            PrbInterval::new(first_free, stop)
        }
        None => PrbInterval::default(),
    }
}

/// Interval of `min(nof_rbs, longest available)` unused bits starting the search at `start`.
///
/// First fit: the first run reaching `nof_rbs` wins even if a longer run exists later.
/// If no run is long enough the longest one found is returned.
pub fn find_empty_interval_of_length<const WORDS: usize>(
    used: &ResourceBitmap<WORDS>,
    nof_rbs: usize,
    start: usize,
) -> PrbInterval {
    let mut best = PrbInterval::default();
    let mut pos = start;
    while pos < used.size() {
        let interval = find_next_empty_interval(used, pos, used.size());
        if interval.is_empty() {
            break;
        }
        if interval.length() >= nof_rbs {
            return PrbInterval::new(interval.start(), interval.start() + nof_rbs);
        }
        if interval.length() > best.length() {
            best = interval;
        }
        pos = interval.stop();
    }
    best
}
