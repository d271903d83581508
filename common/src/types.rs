//! Common Types for 5G GNodeB
//!
//! Defines fundamental types used throughout the scheduling stack

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Paging RNTI
    pub const P_RNTI: Self = Self(0xFFFE);
    /// System information RNTI
    pub const SI_RNTI: Self = Self(0xFFFF);
    /// First C-RNTI handed out to connected UEs
    pub const MIN_CRNTI: Self = Self(0x4601);

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether the RNTI is in the range reserved for connected UEs
    pub fn is_crnti(&self) -> bool {
        self.0 >= 0x0001 && self.0 <= 0xFFEF
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HARQ process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HarqId(pub u8);

impl HarqId {
    /// Maximum number of HARQ processes per direction
    pub const MAX_NOF_HARQS: usize = 16;
}

impl fmt::Display for HarqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology index (mu)
    pub fn numerology(&self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }

    /// Build from a numerology index
    pub fn from_numerology(mu: u8) -> Option<Self> {
        match mu {
            0 => Some(SubcarrierSpacing::Scs15),
            1 => Some(SubcarrierSpacing::Scs30),
            2 => Some(SubcarrierSpacing::Scs60),
            3 => Some(SubcarrierSpacing::Scs120),
            4 => Some(SubcarrierSpacing::Scs240),
            _ => None,
        }
    }

    /// Number of slots per 10 ms frame
    pub fn slots_per_frame(&self) -> u32 {
        10 << self.numerology()
    }

    /// Slot duration in microseconds
    pub fn slot_duration_us(&self) -> u32 {
        1000 >> self.numerology()
    }
}

/// Bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
    /// 25 MHz
    Bw25,
    /// 30 MHz
    Bw30,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 60 MHz
    Bw60,
    /// 80 MHz
    Bw80,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Parse a channel bandwidth given in MHz
    pub fn from_mhz(mhz: u32) -> Option<Self> {
        let bw = match mhz {
            5 => Bandwidth::Bw5,
            10 => Bandwidth::Bw10,
            15 => Bandwidth::Bw15,
            20 => Bandwidth::Bw20,
            25 => Bandwidth::Bw25,
            30 => Bandwidth::Bw30,
            40 => Bandwidth::Bw40,
            50 => Bandwidth::Bw50,
            60 => Bandwidth::Bw60,
            80 => Bandwidth::Bw80,
            100 => Bandwidth::Bw100,
            _ => return None,
        };
        Some(bw)
    }

    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw15 => 15_000_000,
            Bandwidth::Bw20 => 20_000_000,
            Bandwidth::Bw25 => 25_000_000,
            Bandwidth::Bw30 => 30_000_000,
            Bandwidth::Bw40 => 40_000_000,
            Bandwidth::Bw50 => 50_000_000,
            Bandwidth::Bw60 => 60_000_000,
            Bandwidth::Bw80 => 80_000_000,
            Bandwidth::Bw100 => 100_000_000,
        }
    }
}

/// Transmission direction of a grant or HARQ process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Downlink,
    Uplink,
}
