//! Message Types for MAC-PHY Communication
//!
//! Defines the PDUs the scheduler emits per slot and the indications the PHY
//! reports back once channel processing completes.

use common::{Direction, HarqId, PrbGrant, PrbInterval, Rnti, SlotPoint};
use serde::Serialize;

/// Range of OFDM symbols `[start, stop)` within a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SymbolRange {
    pub start: u8,
    pub stop: u8,
}

impl SymbolRange {
    /// Number of OFDM symbols per slot with normal cyclic prefix
    pub const NOF_SYMBOLS_PER_SLOT: u8 = 14;

    /// Create a new symbol range
    pub fn new(start: u8, stop: u8) -> Self {
        assert!(start < stop && stop <= Self::NOF_SYMBOLS_PER_SLOT, "invalid symbol range [{}, {})", start, stop);
        Self { start, stop }
    }

    /// Number of symbols in the range
    pub fn length(&self) -> u8 {
        self.stop - self.start
    }
}

/// PDCCH PDU carrying one DCI
#[derive(Debug, Clone, Serialize)]
pub struct PdcchPdu {
    /// RNTI the DCI is scrambled with
    pub rnti: Rnti,
    /// Whether the DCI schedules a PDSCH or a PUSCH
    pub direction: Direction,
    /// First CCE of the candidate
    pub cce_index: u16,
    /// Aggregation level (1, 2, 4, 8 or 16)
    pub aggregation_level: u8,
}

/// PDSCH PDU
#[derive(Debug, Clone, Serialize)]
pub struct PdschPdu {
    pub rnti: Rnti,
    /// HARQ process, absent for broadcast/paging transmissions
    pub harq_id: Option<HarqId>,
    pub grant: PrbGrant,
    pub symbols: SymbolRange,
    /// Transport block size in bytes
    pub tbs_bytes: u32,
    /// Redundancy version
    pub rv: u8,
    /// New data indicator
    pub ndi: bool,
    /// Whether this is a new transmission or a retransmission
    pub new_data: bool,
}

/// PUSCH PDU
#[derive(Debug, Clone, Serialize)]
pub struct PuschPdu {
    pub rnti: Rnti,
    pub harq_id: HarqId,
    pub prbs: PrbInterval,
    pub symbols: SymbolRange,
    pub tbs_bytes: u32,
    pub rv: u8,
    pub ndi: bool,
    pub new_data: bool,
    /// Codeblocks reserved in the softbuffer for decoding
    pub nof_codeblocks: u32,
}

/// PUCCH PDU carrying HARQ-ACK for a PDSCH
#[derive(Debug, Clone, Serialize)]
pub struct PucchPdu {
    pub rnti: Rnti,
    /// DL HARQ process being acknowledged
    pub harq_id: HarqId,
    /// PRB of the PUCCH resource
    pub prb: u16,
}

/// PRACH capture request from upper layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrachRequest {
    /// Slot in which the PRACH occasion starts
    pub slot: SlotPoint,
    /// First OFDM symbol of the occasion
    pub start_symbol: u8,
    /// Number of frequency-multiplexed occasions
    pub nof_fd_occasions: u8,
}

/// PRACH PDU
#[derive(Debug, Clone, Serialize)]
pub struct PrachPdu {
    pub start_symbol: u8,
    pub nof_fd_occasions: u8,
}

/// Paging PDU
#[derive(Debug, Clone, Serialize)]
pub struct PagingPdu {
    /// 5G-S-TMSI or I-RNTI of the paged UE
    pub paging_identity: u64,
    /// PDSCH resources carrying the paging message
    pub prbs: PrbInterval,
}

/// CSI-RS PDU
#[derive(Debug, Clone, Serialize)]
pub struct CsiRsPdu {
    pub resource_id: u8,
    pub prbs: PrbInterval,
    pub symbol: u8,
}

/// PUSCH decode result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrcIndication {
    pub rnti: Rnti,
    pub harq_id: HarqId,
    /// Slot the PUSCH was received in
    pub slot: SlotPoint,
    pub crc_ok: bool,
    /// LDPC decoder iterations, if reported
    pub decoder_iterations: Option<u32>,
}

/// HARQ-ACK received on PUCCH for a DL HARQ process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UciIndication {
    pub rnti: Rnti,
    pub harq_id: HarqId,
    pub slot: SlotPoint,
    /// `None` means the UE did not answer (DTX)
    pub ack: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_serialization() {
        let pdu = PdschPdu {
            rnti: Rnti(0x4601),
            harq_id: Some(HarqId(3)),
            grant: PrbInterval::new(0, 10).into(),
            symbols: SymbolRange::new(2, 14),
            tbs_bytes: 1200,
            rv: 0,
            ndi: true,
            new_data: true,
        };

        let json = serde_json::to_value(&pdu).unwrap();
        assert_eq!(json["rnti"], 0x4601);
        assert_eq!(json["grant"]["Interval"]["start"], 0);
        assert_eq!(json["grant"]["Interval"]["stop"], 10);
        assert_eq!(json["symbols"]["stop"], 14);
    }

    #[test]
    #[should_panic]
    fn test_invalid_symbol_range() {
        let _ = SymbolRange::new(4, 15);
    }
}
