//! Loopback PHY
//!
//! Stands in for the lower layers when no radio is attached. Slot results are
//! "transmitted" by decoding every PUSCH into its reserved softbuffer and
//! answering every PUCCH, with configurable error rates. The resulting CRC and
//! HARQ-ACK indications become due once their slot has gone over the air.
//! New transmissions are also tallied per UE so the traffic source can follow
//! how much of its offered load went out without asking the scheduler.

use crate::config::LoopbackConfig;
use common::{CellId, Rnti, SlotPoint};
use std::collections::HashMap;
use interfaces::message_types::{CrcIndication, PuschPdu, UciIndication};
use interfaces::{SlotPduSet, SlotResultSink};
use layers::dispatch::SlotDispatcher;
use layers::phy::{SoftbufferId, SoftbufferPool};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

/// Indication produced by the loopback PHY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Crc(CrcIndication),
    Uci(UciIndication),
}

impl Feedback {
    fn slot(&self) -> SlotPoint {
        match self {
            Feedback::Crc(crc) => crc.slot,
            Feedback::Uci(uci) => uci.slot,
        }
    }

    /// Hand the indication to the cell it belongs to
    pub fn deliver(self, dispatcher: &SlotDispatcher) {
        match self {
            Feedback::Crc(crc) => dispatcher.handle_crc_indication(crc),
            Feedback::Uci(uci) => dispatcher.handle_uci_indication(uci),
        }
    }
}

/// New-data bytes carried for one UE since the last [`LoopbackPhy::take_served`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServedBytes {
    pub dl: u32,
    pub ul: u32,
}

/// Loopback PHY of one cell
pub struct LoopbackPhy {
    cell: CellId,
    softbuffers: SoftbufferPool,
    cfg: LoopbackConfig,
    rng: Mutex<StdRng>,
    pending: Mutex<Vec<Feedback>>,
    served: Mutex<HashMap<Rnti, ServedBytes>>,
}

impl LoopbackPhy {
    pub fn new(cell: CellId, softbuffers: SoftbufferPool, cfg: LoopbackConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed ^ cell.0 as u64);
        Self {
            cell,
            softbuffers,
            cfg,
            rng: Mutex::new(rng),
            pending: Mutex::new(Vec::new()),
            served: Mutex::new(HashMap::new()),
        }
    }

    /// Remove and return the bytes served per UE so far
    pub fn take_served(&self) -> HashMap<Rnti, ServedBytes> {
        std::mem::take(&mut *self.served.lock())
    }

    fn record_served(&self, result: &SlotPduSet) {
        let mut served = self.served.lock();
        for pdu in result.pdsch.iter().filter(|pdu| pdu.new_data && pdu.harq_id.is_some()) {
            let entry = served.entry(pdu.rnti).or_default();
            entry.dl = entry.dl.saturating_add(pdu.tbs_bytes);
        }
        for pdu in result.pusch.iter().filter(|pdu| pdu.new_data) {
            let entry = served.entry(pdu.rnti).or_default();
            entry.ul = entry.ul.saturating_add(pdu.tbs_bytes);
        }
    }

    /// Remove and return the indications whose slot is not after `current`
    pub fn take_due(&self, current: SlotPoint) -> Vec<Feedback> {
        let mut pending = self.pending.lock();
        let mut due = Vec::new();
        pending.retain(|feedback| {
            if current - feedback.slot() >= 0 {
                due.push(*feedback);
                false
            } else {
                true
            }
        });
        due
    }

    pub fn nof_pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn decode_pusch(&self, slot: SlotPoint, pdu: &PuschPdu, rng: &mut StdRng) -> CrcIndication {
        let id = SoftbufferId::new(pdu.rnti, pdu.harq_id);
        let mut crc = CrcIndication {
            rnti: pdu.rnti,
            harq_id: pdu.harq_id,
            slot,
            crc_ok: false,
            decoder_iterations: None,
        };

        let mut buffer = match self.softbuffers.reserve(slot, id, pdu.nof_codeblocks as usize) {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!("Cell {} slot {}: no softbuffer for {}: {}", self.cell, slot, id, e);
                return crc;
            }
        };
        if pdu.new_data {
            buffer.reset_codeblock_crcs();
        }

        let tb_error = rng.gen_bool(self.cfg.ul_bler);
        let failed_cb = rng.gen_range(0..buffer.nof_codeblocks());
        let mut iterations = 0;
        for cb in 0..buffer.nof_codeblocks() {
            // Codeblocks decoded in an earlier transmission are skipped
            if buffer.codeblock_crc(cb) {
                continue;
            }
            let ok = !(tb_error && cb == failed_cb);
            let soft_bits = buffer.codeblock_soft_bits(cb).len();
            trace!("Decoding codeblock {} of {} ({} soft bits)", cb, id, soft_bits);
            buffer.set_codeblock_crc(cb, ok);
            iterations = iterations.max(rng.gen_range(1..=self.cfg.max_decoder_iterations.max(1)));
        }
        crc.crc_ok = (0..buffer.nof_codeblocks()).all(|cb| buffer.codeblock_crc(cb));
        crc.decoder_iterations = (iterations > 0).then_some(iterations);
        // A failed transport block keeps its soft bits for the retransmission
        if crc.crc_ok {
            buffer.release();
        }
        crc
    }
}

impl SlotResultSink for LoopbackPhy {
    fn on_new_slot_result(&self, cell: CellId, result: SlotPduSet) {
        debug_assert_eq!(cell, self.cell);
        let slot = result.slot;
        self.record_served(&result);
        let mut rng = self.rng.lock();
        let mut produced = Vec::with_capacity(result.pusch.len() + result.pucch.len());

        for pdu in &result.pusch {
            produced.push(Feedback::Crc(self.decode_pusch(slot, pdu, &mut rng)));
        }
        for pdu in &result.pucch {
            let ack = if rng.gen_bool(self.cfg.dtx_probability) {
                None
            } else {
                Some(!rng.gen_bool(self.cfg.dl_bler))
            };
            produced.push(Feedback::Uci(UciIndication { rnti: pdu.rnti, harq_id: pdu.harq_id, slot, ack }));
        }
        drop(rng);

        trace!(
            "Cell {} slot {}: {} PDCCH, {} PDSCH, {} PUSCH, {} PUCCH",
            cell, slot, result.pdcch.len(), result.pdsch.len(), result.pusch.len(), result.pucch.len()
        );
        self.pending.lock().extend(produced);
    }
}
