//! Common Utilities
//!
//! Provides utility functions used across the GNodeB implementation

use crate::types::{Bandwidth, SubcarrierSpacing};
use tracing::trace;

/// Maximum LDPC codeblock size for base graph 1, in bits
pub const LDPC_MAX_CODEBLOCK_BITS: u32 = 8448;

/// Transport block CRC length for large transport blocks, in bits
const TB_CRC_BITS: u32 = 24;

/// Codeblock CRC length, in bits
const CB_CRC_BITS: u32 = 24;

/// Round up to next power of 2
pub fn next_power_of_2(n: u32) -> u32 {
    if n == 0 {
        return 1;
    }

    let mut v = n;
    v -= 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v + 1
}

/// Number of LDPC codeblocks a transport block of `tbs_bits` is segmented into (TS 38.212 5.2.2)
pub fn ldpc_nof_codeblocks(tbs_bits: u32) -> u32 {
    let b = tbs_bits + TB_CRC_BITS;
    if b <= LDPC_MAX_CODEBLOCK_BITS {
        1
    } else {
        b.div_ceil(LDPC_MAX_CODEBLOCK_BITS - CB_CRC_BITS)
    }
}

/// Transmission bandwidth configuration N_RB, TS 38.104 Table 5.3.2-1
pub fn nof_prbs(bandwidth: Bandwidth, scs: SubcarrierSpacing) -> Option<u16> {
    let nrb = match (bandwidth, scs) {
        (Bandwidth::Bw5, SubcarrierSpacing::Scs15) => 25,
        (Bandwidth::Bw5, SubcarrierSpacing::Scs30) => 11,
        (Bandwidth::Bw10, SubcarrierSpacing::Scs15) => 52,
        (Bandwidth::Bw10, SubcarrierSpacing::Scs30) => 24,
        (Bandwidth::Bw10, SubcarrierSpacing::Scs60) => 11,
        (Bandwidth::Bw15, SubcarrierSpacing::Scs15) => 79,
        (Bandwidth::Bw15, SubcarrierSpacing::Scs30) => 38,
        (Bandwidth::Bw15, SubcarrierSpacing::Scs60) => 18,
        (Bandwidth::Bw20, SubcarrierSpacing::Scs15) => 106,
        (Bandwidth::Bw20, SubcarrierSpacing::Scs30) => 51,
        (Bandwidth::Bw20, SubcarrierSpacing::Scs60) => 24,
        (Bandwidth::Bw25, SubcarrierSpacing::Scs15) => 133,
        (Bandwidth::Bw25, SubcarrierSpacing::Scs30) => 65,
        (Bandwidth::Bw25, SubcarrierSpacing::Scs60) => 31,
        (Bandwidth::Bw30, SubcarrierSpacing::Scs15) => 160,
        (Bandwidth::Bw30, SubcarrierSpacing::Scs30) => 78,
        (Bandwidth::Bw30, SubcarrierSpacing::Scs60) => 38,
        (Bandwidth::Bw40, SubcarrierSpacing::Scs15) => 216,
        (Bandwidth::Bw40, SubcarrierSpacing::Scs30) => 106,
        (Bandwidth::Bw40, SubcarrierSpacing::Scs60) => 51,
        (Bandwidth::Bw50, SubcarrierSpacing::Scs15) => 270,
        (Bandwidth::Bw50, SubcarrierSpacing::Scs30) => 133,
        (Bandwidth::Bw50, SubcarrierSpacing::Scs60) => 65,
        (Bandwidth::Bw50, SubcarrierSpacing::Scs120) => 32,
        (Bandwidth::Bw60, SubcarrierSpacing::Scs30) => 162,
        (Bandwidth::Bw60, SubcarrierSpacing::Scs60) => 79,
        (Bandwidth::Bw60, SubcarrierSpacing::Scs120) => 38,
        (Bandwidth::Bw80, SubcarrierSpacing::Scs30) => 217,
        (Bandwidth::Bw80, SubcarrierSpacing::Scs60) => 107,
        (Bandwidth::Bw80, SubcarrierSpacing::Scs120) => 51,
        (Bandwidth::Bw100, SubcarrierSpacing::Scs30) => 273,
        (Bandwidth::Bw100, SubcarrierSpacing::Scs60) => 135,
        (Bandwidth::Bw100, SubcarrierSpacing::Scs120) => 66,
        _ => return None,
    };

    trace!("N_RB={} for {:?} with {:?}", nrb, bandwidth, scs);
    Some(nrb)
}
