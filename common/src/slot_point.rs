//! Slot Point
//!
//! Wrapping slot counter identifying (numerology, SFN, slot). Arithmetic wraps at
//! 1024 system frames (10.24 s) and differences are the shortest signed distance.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Number of system frames before the SFN wraps
pub const NOF_SFNS: u32 = 1024;

/// Maximum numerology index supported
pub const MAX_NUMEROLOGY: u8 = 4;

/// A point in slot time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotPoint {
    numerology: u8,
    count: u32,
}

impl SlotPoint {
    /// Create a slot point from SFN and slot index within the frame
    pub fn new(numerology: u8, sfn: u32, slot: u32) -> Self {
        assert!(numerology <= MAX_NUMEROLOGY, "invalid numerology {}", numerology);
        let slots_per_frame = 10u32 << numerology;
        assert!(sfn < NOF_SFNS, "invalid SFN {}", sfn);
        assert!(slot < slots_per_frame, "invalid slot index {}", slot);
        Self { numerology, count: sfn * slots_per_frame + slot }
    }

    /// Create a slot point from a raw slot count, taken modulo the wrap period
    pub fn from_count(numerology: u8, count: u32) -> Self {
        assert!(numerology <= MAX_NUMEROLOGY, "invalid numerology {}", numerology);
        let period = Self::period_for(numerology);
        Self { numerology, count: count % period }
    }

    fn period_for(numerology: u8) -> u32 {
        NOF_SFNS * (10u32 << numerology)
    }

    /// Numerology index
    pub fn numerology(&self) -> u8 {
        self.numerology
    }

    /// Slot count since SFN 0, slot 0
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Slots in one 10 ms frame at this numerology
    pub fn nof_slots_per_frame(&self) -> u32 {
        10 << self.numerology
    }

    /// Slots before the counter wraps
    pub fn nof_slots_per_wrap(&self) -> u32 {
        Self::period_for(self.numerology)
    }

    /// System frame number
    pub fn sfn(&self) -> u32 {
        self.count / self.nof_slots_per_frame()
    }

    /// Slot index within the frame
    pub fn slot_index(&self) -> u32 {
        self.count % self.nof_slots_per_frame()
    }

    /// Signed shortest distance `self - other` in slots
    pub fn distance(&self, other: &SlotPoint) -> i32 {
        debug_assert_eq!(self.numerology, other.numerology, "numerology mismatch");
        let period = self.nof_slots_per_wrap();
        let diff = (self.count + period - other.count) % period;
        if diff >= period / 2 {
            diff as i32 - period as i32
        } else {
            diff as i32
        }
    }
}

impl Add<u32> for SlotPoint {
    type Output = SlotPoint;

    fn add(self, slots: u32) -> SlotPoint {
        let period = self.nof_slots_per_wrap();
        SlotPoint {
            numerology: self.numerology,
            count: ((self.count as u64 + slots as u64) % period as u64) as u32,
        }
    }
}

impl AddAssign<u32> for SlotPoint {
    fn add_assign(&mut self, slots: u32) {
        *self = *self + slots;
    }
}

impl Sub<u32> for SlotPoint {
    type Output = SlotPoint;

    fn sub(self, slots: u32) -> SlotPoint {
        let period = self.nof_slots_per_wrap();
        let slots = slots % period;
        SlotPoint {
            numerology: self.numerology,
            count: (self.count + period - slots) % period,
        }
    }
}

impl SubAssign<u32> for SlotPoint {
    fn sub_assign(&mut self, slots: u32) {
        *self = *self - slots;
    }
}

impl Sub<SlotPoint> for SlotPoint {
    type Output = i32;

    fn sub(self, other: SlotPoint) -> i32 {
        self.distance(&other)
    }
}

impl PartialOrd for SlotPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.numerology != other.numerology {
            return None;
        }
        Some(self.distance(other).cmp(&0))
    }
}

impl fmt::Display for SlotPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sfn(), self.slot_index())
    }
}
