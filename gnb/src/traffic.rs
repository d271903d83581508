//! Synthetic Traffic
//!
//! Attaches test UEs to a cell and offers them random DL and UL traffic, PRACH
//! occasions and paging requests, as the upper layers would. Buffer occupancy
//! is tracked locally from the bytes the PHY reports as served.

use crate::config::TestUeConfig;
use crate::loopback::ServedBytes;
use common::{Rnti, SlotPoint};
use std::collections::HashMap;
use interfaces::message_types::PrachRequest;
use layers::dispatch::SlotDispatcher;
use layers::mac::UeConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// Logical channel carrying the synthetic DL data
const DATA_LCID: u8 = 4;

/// PRACH occasions are requested this many slots beyond the late window
const PRACH_REQUEST_MARGIN: u32 = 2;

/// Bytes offered to one UE and not yet served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Backlog {
    dl: u32,
    ul: u32,
}

pub struct TrafficGenerator {
    cfg: TestUeConfig,
    rntis: Vec<Rnti>,
    backlog: Vec<Backlog>,
    processing_delay_slots: u32,
    rng: StdRng,
    next_paging_identity: u64,
}

impl TrafficGenerator {
    pub fn new(cfg: TestUeConfig, processing_delay_slots: u32, cell_index: usize) -> Self {
        let rntis = (0..cfg.count)
            .map(|i| Rnti(Rnti::MIN_CRNTI.value() + (cell_index * cfg.count + i) as u16))
            .collect();
        let rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(cell_index as u64));
        let backlog = vec![Backlog::default(); cfg.count];
        Self { cfg, rntis, backlog, processing_delay_slots, rng, next_paging_identity: 1 }
    }

    pub fn rntis(&self) -> &[Rnti] {
        &self.rntis
    }

    /// Register the test UEs with the cell
    pub fn attach(&self, dispatcher: &SlotDispatcher) {
        for (i, rnti) in self.rntis().iter().enumerate() {
            let mut cfg = UeConfig::new(*rnti);
            // Spread link qualities so the policies have something to rank
            cfg.dl_bytes_per_prb = 30 + 15 * (i as u32 % 5);
            cfg.ul_bytes_per_prb = 20 + 10 * (i as u32 % 5);
            cfg.max_prbs = 32;
            dispatcher.add_ue(cfg);
        }
        info!("Cell {}: attached {} test UEs", dispatcher.cell_id(), self.rntis().len());
    }

    /// Take the bytes served since the previous slot off the backlog
    fn apply_served(&mut self, served: &HashMap<Rnti, ServedBytes>) {
        for (rnti, backlog) in self.rntis.iter().zip(self.backlog.iter_mut()) {
            if let Some(bytes) = served.get(rnti) {
                backlog.dl = backlog.dl.saturating_sub(bytes.dl);
                backlog.ul = backlog.ul.saturating_sub(bytes.ul);
            }
        }
    }

    /// Offer the traffic of one slot, given what went out since the previous one
    pub fn on_slot(&mut self, slot: SlotPoint, dispatcher: &SlotDispatcher, served: &HashMap<Rnti, ServedBytes>) {
        self.apply_served(served);
        for i in 0..self.rntis.len() {
            let rnti = self.rntis[i];
            if self.rng.gen_bool(self.cfg.dl_arrival_probability) {
                let backlog = &mut self.backlog[i];
                backlog.dl = backlog.dl.saturating_add(self.cfg.dl_burst_bytes);
                dispatcher.handle_dl_buffer_status(rnti, DATA_LCID, backlog.dl);
            }
            if self.rng.gen_bool(self.cfg.ul_arrival_probability) {
                let backlog = &mut self.backlog[i];
                backlog.ul = backlog.ul.saturating_add(self.cfg.ul_burst_bytes);
                dispatcher.handle_bsr(rnti, backlog.ul);
            }
        }

        let count = slot.count();
        if self.cfg.prach_period_slots > 0 && count % self.cfg.prach_period_slots == 0 {
            let request = PrachRequest {
                slot: slot + self.processing_delay_slots + PRACH_REQUEST_MARGIN,
                start_symbol: 0,
                nof_fd_occasions: 1,
            };
            if !dispatcher.handle_prach_request(request) {
                debug!("Cell {}: PRACH request for {} refused", dispatcher.cell_id(), request.slot);
            }
        }
        if self.cfg.paging_period_slots > 0 && count % self.cfg.paging_period_slots == 0 {
            dispatcher.handle_paging_request(self.next_paging_identity);
            self.next_paging_identity += 1;
        }
    }
}
