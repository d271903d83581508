//! Cell Resource Grid Occupancy
//!
//! Ring of per-slot allocation state indexed by `slot mod ring_size`. Each entry holds
//! the DL and UL PRB occupancy per OFDM symbol, the PDCCH CCE occupancy and the PDU
//! set being built for that slot. An entry is cleared when it is recycled for a slot
//! `ring_size` slots ahead, so nothing from an old slot leaks into a new decision.

use crate::LayerError;
use common::{CceBitmap, PrbBitmap, SlotPoint, MAX_NOF_CCES, MAX_NOF_PRBS};
use common::slot_point::NOF_SFNS;
use interfaces::message_types::SymbolRange;
use interfaces::{PduCeilings, SlotPduSet};
use std::mem;
use tracing::{debug, info};

/// OFDM symbols per slot with normal cyclic prefix
pub const NOF_OFDM_SYMBOLS: usize = SymbolRange::NOF_SYMBOLS_PER_SLOT as usize;

/// PRB occupancy per OFDM symbol of one slot in one direction
#[derive(Debug, Clone)]
pub struct SymbolPrbGrid {
    symbols: [PrbBitmap; NOF_OFDM_SYMBOLS],
}

impl SymbolPrbGrid {
    pub fn new(nof_prbs: usize) -> Self {
        Self { symbols: [PrbBitmap::new(nof_prbs); NOF_OFDM_SYMBOLS] }
    }

    /// Clear all symbols
    pub fn clear(&mut self) {
        for symbol in self.symbols.iter_mut() {
            symbol.reset_all();
        }
    }

    /// PRBs used in any symbol of `symbols`
    pub fn used_prbs(&self, symbols: SymbolRange) -> PrbBitmap {
        let mut used = PrbBitmap::new(self.symbols[0].size());
        for symbol in &self.symbols[symbols.start as usize..symbols.stop as usize] {
            used |= *symbol;
        }
        used
    }

    /// Whether any PRB of `prbs` is used in any symbol of `symbols`
    pub fn collides(&self, symbols: SymbolRange, prbs: &PrbBitmap) -> bool {
        (self.used_prbs(symbols) & *prbs).any()
    }

    /// Mark `prbs` as used over `symbols`. Overlapping an existing allocation is a bug.
    pub fn fill(&mut self, symbols: SymbolRange, prbs: &PrbBitmap) {
        assert!(
            !self.collides(symbols, prbs),
            "double allocation of PRBs {} in symbols [{}, {})",
            prbs, symbols.start, symbols.stop
        );
        for symbol in &mut self.symbols[symbols.start as usize..symbols.stop as usize] {
            *symbol |= *prbs;
        }
    }
}

/// Allocation state of one slot
#[derive(Debug, Clone)]
pub struct SlotResources {
    slot: SlotPoint,
    /// PDSCH/PDCCH PRB occupancy
    pub dl_prbs: SymbolPrbGrid,
    /// PUSCH/PUCCH PRB occupancy
    pub ul_prbs: SymbolPrbGrid,
    /// CORESET CCE occupancy
    pub pdcch_cces: CceBitmap,
    /// PDUs committed for this slot so far
    pub result: SlotPduSet,
}

impl SlotResources {
    fn new(slot: SlotPoint, cfg: &ResourceGridConfig) -> Self {
        Self {
            slot,
            dl_prbs: SymbolPrbGrid::new(cfg.nof_prbs),
            ul_prbs: SymbolPrbGrid::new(cfg.nof_prbs),
            pdcch_cces: CceBitmap::new(cfg.nof_cces),
            result: SlotPduSet::new(slot, &cfg.ceilings),
        }
    }

    fn recycle(&mut self, slot: SlotPoint, ceilings: &PduCeilings) {
        self.slot = slot;
        self.dl_prbs.clear();
        self.ul_prbs.clear();
        self.pdcch_cces.reset_all();
        self.result = SlotPduSet::new(slot, ceilings);
    }

    /// Slot this entry currently represents
    pub fn slot(&self) -> SlotPoint {
        self.slot
    }
}

/// Resource grid configuration
#[derive(Debug, Clone)]
pub struct ResourceGridConfig {
    pub numerology: u8,
    pub nof_prbs: usize,
    pub nof_cces: usize,
    /// Furthest slot ahead of the current one an allocation may target
    pub max_lookahead_slots: u32,
    /// Explicit ring size. Derived from the look-ahead when absent.
    pub ring_size: Option<u32>,
    pub ceilings: PduCeilings,
}

/// Smallest power-of-two multiple of the slots per frame holding `max_lookahead_slots + 1` slots
pub fn default_ring_size(numerology: u8, max_lookahead_slots: u32) -> u32 {
    let slots_per_frame = 10u32 << numerology;
    let mut ring_size = slots_per_frame;
    while ring_size <= max_lookahead_slots {
        ring_size *= 2;
    }
    ring_size
}

impl ResourceGridConfig {
    /// Ring size that will be used
    pub fn effective_ring_size(&self) -> u32 {
        self.ring_size.unwrap_or_else(|| default_ring_size(self.numerology, self.max_lookahead_slots))
    }

    /// Reject ring sizes that could alias two live slots
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.nof_prbs == 0 || self.nof_prbs > MAX_NOF_PRBS {
            return Err(LayerError::InvalidConfiguration(format!(
                "number of PRBs {} outside [1, {}]", self.nof_prbs, MAX_NOF_PRBS
            )));
        }
        if self.nof_cces == 0 || self.nof_cces > MAX_NOF_CCES {
            return Err(LayerError::InvalidConfiguration(format!(
                "number of CCEs {} outside [1, {}]", self.nof_cces, MAX_NOF_CCES
            )));
        }
        let ring_size = self.effective_ring_size();
        let wrap_period = NOF_SFNS * (10u32 << self.numerology);
        if ring_size == 0 || wrap_period % ring_size != 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "ring size {} does not divide the slot wrap period {}", ring_size, wrap_period
            )));
        }
        if ring_size <= self.max_lookahead_slots {
            return Err(LayerError::InvalidConfiguration(format!(
                "ring size {} too small for a look-ahead of {} slots", ring_size, self.max_lookahead_slots
            )));
        }
        Ok(())
    }
}

/// Per-cell ring of slot allocation state
#[derive(Debug)]
pub struct CellResourceAllocator {
    cfg: ResourceGridConfig,
    ring: Vec<SlotResources>,
    last_slot: Option<SlotPoint>,
}

impl CellResourceAllocator {
    pub fn new(cfg: ResourceGridConfig) -> Result<Self, LayerError> {
        cfg.validate()?;
        let ring_size = cfg.effective_ring_size();
        info!(
            "Resource grid ring: {} slots for a look-ahead of {} slots ({} PRBs, {} CCEs)",
            ring_size, cfg.max_lookahead_slots, cfg.nof_prbs, cfg.nof_cces
        );
        let ring = (0..ring_size)
            .map(|i| SlotResources::new(SlotPoint::from_count(cfg.numerology, i), &cfg))
            .collect();
        Ok(Self { cfg, ring, last_slot: None })
    }

    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }

    pub fn max_lookahead_slots(&self) -> u32 {
        self.cfg.max_lookahead_slots
    }

    /// Current slot, once the first indication arrived
    pub fn last_slot(&self) -> Option<SlotPoint> {
        self.last_slot
    }

    fn index(&self, slot: SlotPoint) -> usize {
        slot.count() as usize % self.ring.len()
    }

    /// Advance the window to `slot`, recycling the entries of every slot left behind
    pub fn slot_indication(&mut self, slot: SlotPoint) {
        let ring_size = self.ring.len() as u32;
        let ceilings = self.cfg.ceilings;
        match self.last_slot {
            Some(last) => {
                let gap = slot - last;
                assert!(gap > 0, "slot indication {} not after {}", slot, last);
                if gap as u32 >= ring_size {
                    self.reset_window(slot);
                } else {
                    for k in 0..gap as u32 {
                        let old = last + k;
                        let idx = self.index(old);
                        self.ring[idx].recycle(old + ring_size, &ceilings);
                    }
                }
                if gap > 1 {
                    debug!("Resource grid skipped {} slots up to {}", gap - 1, slot);
                }
            }
            None => self.reset_window(slot),
        }
        self.last_slot = Some(slot);
    }

    fn reset_window(&mut self, slot: SlotPoint) {
        let ceilings = self.cfg.ceilings;
        for offset in 0..self.ring.len() as u32 {
            let sl = slot + offset;
            let idx = self.index(sl);
            self.ring[idx].recycle(sl, &ceilings);
        }
    }

    fn check_window(&self, slot: SlotPoint) {
        let Some(last) = self.last_slot else {
            panic!("resource grid accessed before the first slot indication");
        };
        let ahead = slot - last;
        assert!(
            ahead >= 0 && ahead as u32 <= self.cfg.max_lookahead_slots,
            "slot {} outside the allocation window [{}, {} + {}]",
            slot, last, last, self.cfg.max_lookahead_slots
        );
    }

    /// Allocation state of `slot`, which must lie within the look-ahead window
    pub fn occupancy_for(&mut self, slot: SlotPoint) -> &mut SlotResources {
        self.check_window(slot);
        let idx = self.index(slot);
        let entry = &mut self.ring[idx];
        assert_eq!(entry.slot, slot, "ring entry aliasing: holds {} while {} requested", entry.slot, slot);
        entry
    }

    /// Allocation state of `slot` if the ring currently holds it
    pub fn get(&self, slot: SlotPoint) -> Option<&SlotResources> {
        let entry = &self.ring[self.index(slot)];
        (entry.slot == slot).then_some(entry)
    }

    /// Hand out the PDU set of `slot`, leaving an empty one behind
    pub fn take_result(&mut self, slot: SlotPoint) -> SlotPduSet {
        let ceilings = self.cfg.ceilings;
        let entry = self.occupancy_for(slot);
        mem::replace(&mut entry.result, SlotPduSet::new(slot, &ceilings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PrbInterval;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn config(numerology: u8, lookahead: u32) -> ResourceGridConfig {
        ResourceGridConfig {
            numerology,
            nof_prbs: 52,
            nof_cces: 16,
            max_lookahead_slots: lookahead,
            ring_size: None,
            ceilings: PduCeilings::default(),
        }
    }

    fn mask(start: usize, stop: usize) -> PrbBitmap {
        PrbBitmap::from_interval(52, PrbInterval::new(start, stop))
    }

    #[test]
    fn test_default_ring_size() {
        assert_eq!(default_ring_size(0, 5), 10);
        assert_eq!(default_ring_size(0, 10), 20);
        assert_eq!(default_ring_size(1, 30), 40);
        assert_eq!(default_ring_size(1, 50), 80);
    }

    #[test]
    fn test_ring_size_validation() {
        let mut cfg = config(1, 16);
        assert!(cfg.validate().is_ok());
        cfg.ring_size = Some(16);
        assert!(cfg.validate().is_err());
        cfg.ring_size = Some(24);
        assert!(cfg.validate().is_err(), "24 does not divide 20480");
        cfg.ring_size = Some(32);
        assert!(cfg.validate().is_ok());
        cfg.nof_prbs = 300;
        assert!(CellResourceAllocator::new(cfg).is_err());
    }

    #[test]
    fn test_symbol_grid_fill_and_collision() {
        let mut grid = SymbolPrbGrid::new(52);
        grid.fill(SymbolRange::new(2, 14), &mask(0, 10));
        assert!(grid.collides(SymbolRange::new(0, 14), &mask(5, 6)));
        assert!(!grid.collides(SymbolRange::new(0, 2), &mask(5, 6)));
        assert!(!grid.collides(SymbolRange::new(2, 14), &mask(10, 20)));
        assert_eq!(grid.used_prbs(SymbolRange::new(0, 14)).count(), 10);
    }

    #[test]
    #[should_panic(expected = "double allocation")]
    fn test_double_allocation_panics() {
        let mut grid = SymbolPrbGrid::new(52);
        grid.fill(SymbolRange::new(0, 14), &mask(0, 10));
        grid.fill(SymbolRange::new(5, 6), &mask(9, 11));
    }

    #[test]
    fn test_stale_slot_is_cleared_on_reuse() {
        let mut alloc = CellResourceAllocator::new(config(0, 4)).unwrap();
        let ring = alloc.ring_size() as u32;
        let start = SlotPoint::new(0, 100, 0);
        alloc.slot_indication(start);
        alloc.occupancy_for(start + 2).dl_prbs.fill(SymbolRange::new(0, 14), &mask(0, 52));

        for k in 1..=ring + 2 {
            alloc.slot_indication(start + k);
        }
        // start + 2 + ring maps to the same entry and must come back empty.
        let reused = alloc.occupancy_for(start + 2 + ring);
        assert_eq!(reused.dl_prbs.used_prbs(SymbolRange::new(0, 14)).count(), 0);
    }

    #[test]
    fn test_skipped_slots_are_recycled() {
        let mut alloc = CellResourceAllocator::new(config(0, 4)).unwrap();
        let start = SlotPoint::new(0, 0, 0);
        alloc.slot_indication(start);
        alloc.occupancy_for(start + 1).ul_prbs.fill(SymbolRange::new(0, 14), &mask(0, 4));
        alloc.slot_indication(start + 7);
        for k in 7..=11 {
            let entry = alloc.occupancy_for(start + k);
            assert_eq!(entry.ul_prbs.used_prbs(SymbolRange::new(0, 14)).count(), 0);
        }
    }

    #[test]
    #[should_panic(expected = "outside the allocation window")]
    fn test_access_beyond_lookahead_panics() {
        let mut alloc = CellResourceAllocator::new(config(0, 4)).unwrap();
        let start = SlotPoint::new(0, 0, 0);
        alloc.slot_indication(start);
        alloc.occupancy_for(start + 5);
    }

    #[test]
    fn test_ring_never_aliases_live_slots() {
        let mut rng = StdRng::seed_from_u64(7);
        for numerology in 0..=2u8 {
            for lookahead in [1u32, 8, 16, 39, 40, 70] {
                let mut alloc = CellResourceAllocator::new(config(numerology, lookahead)).unwrap();
                let ring = alloc.ring_size() as u32;
                let period = SlotPoint::from_count(numerology, 0).nof_slots_per_wrap();
                // Start close to the counter wrap so the window straddles it.
                let mut slot = SlotPoint::from_count(numerology, period - rng.gen_range(1..=ring));
                alloc.slot_indication(slot);
                for _ in 0..3 * ring {
                    slot += rng.gen_range(1..=3);
                    alloc.slot_indication(slot);
                    for k in 0..=lookahead {
                        let target = slot + k;
                        assert_eq!(alloc.occupancy_for(target).slot(), target);
                        assert!(alloc.get(target + ring).is_none());
                    }
                }
            }
        }
    }

    #[test]
    fn test_take_result_leaves_empty_set() {
        use interfaces::message_types::PrachPdu;
        let mut alloc = CellResourceAllocator::new(config(0, 4)).unwrap();
        let start = SlotPoint::new(0, 0, 0);
        alloc.slot_indication(start);
        let pdu = PrachPdu { start_symbol: 0, nof_fd_occasions: 1 };
        assert!(alloc.occupancy_for(start).result.prach.try_push(pdu).is_ok());
        let result = alloc.take_result(start);
        assert_eq!(result.prach.len(), 1);
        assert_eq!(result.slot, start);
        assert!(alloc.take_result(start).is_empty());
    }
}
