//! Per-slot PDU Set
//!
//! Output of one scheduling decision: bounded lists of PDUs per channel type.
//! A list never grows beyond its configured ceiling; a rejected push hands the
//! PDU back so the caller can defer it.

use crate::message_types::{CsiRsPdu, PagingPdu, PdcchPdu, PdschPdu, PrachPdu, PucchPdu, PuschPdu};
use common::SlotPoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel types counted and bounded per slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Pdcch,
    Pdsch,
    Pusch,
    Pucch,
    Prach,
    Paging,
    CsiRs,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::Pdcch => "PDCCH",
            ChannelType::Pdsch => "PDSCH",
            ChannelType::Pusch => "PUSCH",
            ChannelType::Pucch => "PUCCH",
            ChannelType::Prach => "PRACH",
            ChannelType::Paging => "paging",
            ChannelType::CsiRs => "CSI-RS",
        };
        f.write_str(name)
    }
}

/// Maximum number of PDUs of each type per slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PduCeilings {
    pub max_pdcch: usize,
    pub max_pdsch: usize,
    pub max_pusch: usize,
    pub max_pucch: usize,
    pub max_prach: usize,
    pub max_paging: usize,
    pub max_csi_rs: usize,
}

impl Default for PduCeilings {
    fn default() -> Self {
        Self {
            max_pdcch: 16,
            max_pdsch: 8,
            max_pusch: 8,
            max_pucch: 16,
            max_prach: 4,
            max_paging: 2,
            max_csi_rs: 4,
        }
    }
}

impl PduCeilings {
    /// Ceiling for a given channel type
    pub fn for_channel(&self, channel: ChannelType) -> usize {
        match channel {
            ChannelType::Pdcch => self.max_pdcch,
            ChannelType::Pdsch => self.max_pdsch,
            ChannelType::Pusch => self.max_pusch,
            ChannelType::Pucch => self.max_pucch,
            ChannelType::Prach => self.max_prach,
            ChannelType::Paging => self.max_paging,
            ChannelType::CsiRs => self.max_csi_rs,
        }
    }
}

/// List of PDUs bounded by a ceiling fixed at construction
#[derive(Debug, Clone, Serialize)]
pub struct PduList<T> {
    items: Vec<T>,
    #[serde(skip)]
    max: usize,
}

impl<T> PduList<T> {
    /// Create an empty list holding at most `max` PDUs
    pub fn new(max: usize) -> Self {
        Self { items: Vec::with_capacity(max), max }
    }

    /// Append a PDU, handing it back if the ceiling is reached
    pub fn try_push(&mut self, pdu: T) -> Result<(), T> {
        if self.is_full() {
            return Err(pdu);
        }
        self.items.push(pdu);
        Ok(())
    }

    /// Whether no further PDU fits this slot
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max
    }

    /// Remaining room before the ceiling
    pub fn remaining(&self) -> usize {
        self.max - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured ceiling
    pub fn max(&self) -> usize {
        self.max
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<'a, T> IntoIterator for &'a PduList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// All PDUs to transmit or receive in one slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotPduSet {
    pub slot: SlotPoint,
    pub pdcch: PduList<PdcchPdu>,
    pub pdsch: PduList<PdschPdu>,
    pub pusch: PduList<PuschPdu>,
    pub pucch: PduList<PucchPdu>,
    pub prach: PduList<PrachPdu>,
    pub paging: PduList<PagingPdu>,
    pub csi_rs: PduList<CsiRsPdu>,
}

impl SlotPduSet {
    /// Empty PDU set for `slot` bounded by `ceilings`
    pub fn new(slot: SlotPoint, ceilings: &PduCeilings) -> Self {
        Self {
            slot,
            pdcch: PduList::new(ceilings.max_pdcch),
            pdsch: PduList::new(ceilings.max_pdsch),
            pusch: PduList::new(ceilings.max_pusch),
            pucch: PduList::new(ceilings.max_pucch),
            prach: PduList::new(ceilings.max_prach),
            paging: PduList::new(ceilings.max_paging),
            csi_rs: PduList::new(ceilings.max_csi_rs),
        }
    }

    /// Number of PDUs of a channel type
    pub fn count(&self, channel: ChannelType) -> usize {
        match channel {
            ChannelType::Pdcch => self.pdcch.len(),
            ChannelType::Pdsch => self.pdsch.len(),
            ChannelType::Pusch => self.pusch.len(),
            ChannelType::Pucch => self.pucch.len(),
            ChannelType::Prach => self.prach.len(),
            ChannelType::Paging => self.paging.len(),
            ChannelType::CsiRs => self.csi_rs.len(),
        }
    }

    /// Total number of PDUs of all types
    pub fn total(&self) -> usize {
        [
            ChannelType::Pdcch,
            ChannelType::Pdsch,
            ChannelType::Pusch,
            ChannelType::Pucch,
            ChannelType::Prach,
            ChannelType::Paging,
            ChannelType::CsiRs,
        ]
        .iter()
        .map(|c| self.count(*c))
        .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_types::PrachPdu;

    #[test]
    fn test_pdu_list_ceiling() {
        let mut list = PduList::new(2);
        assert!(list.try_push(1).is_ok());
        assert!(list.try_push(2).is_ok());
        assert_eq!(list.try_push(3), Err(3));
        assert!(list.is_full());
        assert_eq!(list.len(), 2);
        assert_eq!(list.remaining(), 0);
    }

    #[test]
    fn test_slot_pdu_set_counts() {
        let ceilings = PduCeilings { max_prach: 1, ..Default::default() };
        let mut set = SlotPduSet::new(SlotPoint::new(0, 0, 0), &ceilings);
        assert!(set.is_empty());
        assert!(set.prach.try_push(PrachPdu { start_symbol: 0, nof_fd_occasions: 1 }).is_ok());
        assert!(set.prach.try_push(PrachPdu { start_symbol: 0, nof_fd_occasions: 1 }).is_err());
        assert_eq!(set.count(ChannelType::Prach), 1);
        assert_eq!(set.total(), 1);
    }
}
