//! Cell Scheduler
//!
//! Slot-synchronous scheduling engine of one cell. Each call to
//! [`CellScheduler::run_slot`] processes HARQ timeouts, places the cell-wide
//! channels (CSI-RS, paging, PRACH), grants DL and UL resources to UEs in policy
//! order and hands out the PDU set of the slot. Retransmissions always go before
//! new data, and nothing is committed to the grid unless every resource the
//! grant needs (ceilings, PRBs, PDCCH, PUCCH, softbuffer) was found first.

use super::harq::HarqOutcome;
use super::pdcch::{self, SearchSpace};
use super::policy::{PolicyKind, SchedulingPolicy};
use super::resource_grid::{CellResourceAllocator, ResourceGridConfig};
use super::ue::{AllocationType, UeConfig, UeContext, UeSchedulingSummary};
use crate::metrics::CellMetrics;
use crate::phy::{SoftbufferId, SoftbufferPool};
use crate::LayerError;
use common::{
    find_empty_interval_of_length, ldpc_nof_codeblocks, CellId, Direction, HarqId, PrbBitmap, PrbGrant,
    PrbInterval, RbgBitmap, RbgConfig, Rnti, SlotPoint, SubcarrierSpacing, MAX_NOF_PRBS,
};
use interfaces::message_types::{
    CrcIndication, CsiRsPdu, PagingPdu, PdcchPdu, PdschPdu, PrachPdu, PrachRequest, PucchPdu, PuschPdu,
    SymbolRange, UciIndication,
};
use interfaces::{PduCeilings, PduList, SlotPduSet};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Cell scheduler configuration
#[derive(Debug, Clone)]
pub struct CellSchedulerConfig {
    pub cell_id: CellId,
    pub scs: SubcarrierSpacing,
    /// Carrier bandwidth in PRBs
    pub nof_prbs: usize,
    /// RBG size configuration 1 (smaller RBGs) for allocation type 0
    pub rbg_config_1: bool,
    /// CCEs in the CORESET
    pub nof_cces: usize,
    /// PDCCH candidates per aggregation level
    pub nof_candidates: usize,
    /// Aggregation level of paging DCIs
    pub paging_aggregation_level: u8,
    pub pdsch_symbols: SymbolRange,
    pub pusch_symbols: SymbolRange,
    pub pucch_symbols: SymbolRange,
    pub ceilings: PduCeilings,
    /// HARQ processes per UE and direction
    pub nof_harqs: usize,
    pub max_harq_retxs: u32,
    /// PDSCH to HARQ-ACK delay in slots
    pub k1: u32,
    /// PDCCH to PUSCH delay in slots
    pub k2: u32,
    /// Slots after the expected feedback before a HARQ process counts as NACKed
    pub harq_feedback_timeout_slots: u32,
    pub max_lookahead_slots: u32,
    pub ring_size: Option<u32>,
    /// CSI-RS periodicity, disabled when absent
    pub csi_rs_period_slots: Option<u32>,
    /// PRBs of a paging PDSCH
    pub paging_prbs: usize,
    pub policy: PolicyKind,
}

impl Default for CellSchedulerConfig {
    fn default() -> Self {
        Self {
            cell_id: CellId(1),
            scs: SubcarrierSpacing::Scs30,
            nof_prbs: 51,
            rbg_config_1: true,
            nof_cces: 16,
            nof_candidates: 2,
            paging_aggregation_level: 4,
            pdsch_symbols: SymbolRange::new(2, 14),
            pusch_symbols: SymbolRange::new(0, 14),
            pucch_symbols: SymbolRange::new(0, 14),
            ceilings: PduCeilings::default(),
            nof_harqs: 8,
            max_harq_retxs: 4,
            k1: 4,
            k2: 4,
            harq_feedback_timeout_slots: 8,
            max_lookahead_slots: 8,
            ring_size: None,
            csi_rs_period_slots: Some(20),
            paging_prbs: 8,
            policy: PolicyKind::RoundRobin,
        }
    }
}

impl CellSchedulerConfig {
    fn grid_config(&self) -> ResourceGridConfig {
        ResourceGridConfig {
            numerology: self.scs.numerology(),
            nof_prbs: self.nof_prbs,
            nof_cces: self.nof_cces,
            max_lookahead_slots: self.max_lookahead_slots,
            ring_size: self.ring_size,
            ceilings: self.ceilings,
        }
    }

    /// Validate scheduler configuration
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.nof_prbs == 0 || self.nof_prbs > MAX_NOF_PRBS {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {} has {} PRBs", self.cell_id, self.nof_prbs
            )));
        }
        if self.k1.max(self.k2) > self.max_lookahead_slots {
            return Err(LayerError::InvalidConfiguration(format!(
                "k1={} k2={} exceed the look-ahead of {} slots", self.k1, self.k2, self.max_lookahead_slots
            )));
        }
        if self.nof_harqs == 0 || self.nof_harqs > HarqId::MAX_NOF_HARQS {
            return Err(LayerError::InvalidConfiguration(format!("{} HARQ processes", self.nof_harqs)));
        }
        if self.nof_candidates == 0 {
            return Err(LayerError::InvalidConfiguration("no PDCCH candidates".into()));
        }
        if !pdcch::AGGREGATION_LEVELS.contains(&self.paging_aggregation_level) {
            return Err(LayerError::InvalidConfiguration(format!(
                "paging aggregation level {}", self.paging_aggregation_level
            )));
        }
        if self.paging_prbs == 0 || self.paging_prbs > self.nof_prbs {
            return Err(LayerError::InvalidConfiguration(format!("paging PRBs {}", self.paging_prbs)));
        }
        let c = &self.ceilings;
        if c.max_pdcch == 0 || c.max_pdsch == 0 || c.max_pusch == 0 || c.max_pucch == 0 {
            return Err(LayerError::InvalidConfiguration("PDU ceilings must allow UE traffic".into()));
        }
        if self.csi_rs_period_slots == Some(0) {
            return Err(LayerError::InvalidConfiguration("CSI-RS period of zero slots".into()));
        }
        self.grid_config().validate()
    }
}

/// Why a grant attempt did not go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantOutcome {
    Allocated,
    /// A per-slot PDU ceiling is reached, nobody else fits this slot either
    CeilingReached,
    NoPrbs,
    NoPdcch,
    NoSoftbuffer,
    Skipped,
}

/// Candidate for a grant this slot, sorted boost first then priority
struct Candidate {
    boost: bool,
    priority: f64,
    rnti: Rnti,
    retx: Option<HarqId>,
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.boost
            .cmp(&a.boost)
            .then(b.priority.total_cmp(&a.priority))
            .then(a.rnti.cmp(&b.rnti))
    });
}

fn push_pdu<T>(list: &mut PduList<T>, pdu: T) {
    assert!(list.try_push(pdu).is_ok(), "PDU ceiling checked before commit");
}

/// First free RBGs in order until `nof_prbs` PRBs are covered
fn select_rbgs(rbg_cfg: &RbgConfig, used: &PrbBitmap, nof_prbs: usize) -> (RbgBitmap, usize) {
    let used_rbgs = rbg_cfg.prb_to_rbg_mask(used);
    let mut rbgs = rbg_cfg.empty_rbgs();
    let mut covered = 0;
    for rbg in 0..rbg_cfg.nof_rbgs() {
        if covered >= nof_prbs {
            break;
        }
        if !used_rbgs.test(rbg) {
            rbgs.set(rbg);
            covered += rbg_cfg.rbg_prbs(rbg).length();
        }
    }
    (rbgs, covered)
}

/// Slot scheduler of one cell
pub struct CellScheduler {
    cfg: CellSchedulerConfig,
    rbg_cfg: RbgConfig,
    grid: CellResourceAllocator,
    ues: BTreeMap<Rnti, UeContext>,
    softbuffers: SoftbufferPool,
    policy: Box<dyn SchedulingPolicy>,
    paging_queue: VecDeque<u64>,
    metrics: Arc<CellMetrics>,
}

impl CellScheduler {
    /// Create the scheduler of a cell. UL grants reserve decode buffers from `softbuffers`.
    pub fn new(cfg: CellSchedulerConfig, softbuffers: SoftbufferPool) -> Result<Self, LayerError> {
        cfg.validate()?;
        let grid = CellResourceAllocator::new(cfg.grid_config())?;
        let rbg_cfg = RbgConfig::new(0, cfg.nof_prbs, cfg.rbg_config_1);
        let policy = cfg.policy.create();
        info!(
            "Cell {} scheduler: {} PRBs, {} RBGs of {}, {} CCEs, k1={} k2={}, policy {}",
            cfg.cell_id,
            cfg.nof_prbs,
            rbg_cfg.nof_rbgs(),
            rbg_cfg.rbg_size(),
            cfg.nof_cces,
            cfg.k1,
            cfg.k2,
            policy.name()
        );
        Ok(Self {
            cfg,
            rbg_cfg,
            grid,
            ues: BTreeMap::new(),
            softbuffers,
            policy,
            paging_queue: VecDeque::new(),
            metrics: Arc::new(CellMetrics::default()),
        })
    }

    pub fn config(&self) -> &CellSchedulerConfig {
        &self.cfg
    }

    pub fn cell_id(&self) -> CellId {
        self.cfg.cell_id
    }

    pub fn metrics(&self) -> Arc<CellMetrics> {
        self.metrics.clone()
    }

    pub fn softbuffers(&self) -> &SoftbufferPool {
        &self.softbuffers
    }

    pub fn rbg_config(&self) -> &RbgConfig {
        &self.rbg_cfg
    }

    /// Replace the scheduling policy
    pub fn set_policy(&mut self, policy: Box<dyn SchedulingPolicy>) {
        info!("Cell {} switching policy to {}", self.cfg.cell_id, policy.name());
        self.policy = policy;
    }

    pub fn add_ue(&mut self, cfg: UeConfig) -> Result<(), LayerError> {
        cfg.validate()?;
        if self.ues.contains_key(&cfg.rnti) {
            return Err(LayerError::DuplicateUe(cfg.rnti));
        }
        info!("Cell {} adding UE {}", self.cfg.cell_id, cfg.rnti);
        let rnti = cfg.rnti;
        self.ues.insert(rnti, UeContext::new(cfg, self.cfg.nof_harqs, self.cfg.max_harq_retxs));
        Ok(())
    }

    /// Update the link parameters of a connected UE
    pub fn reconfigure_ue(&mut self, cfg: UeConfig) -> Result<(), LayerError> {
        cfg.validate()?;
        let ue = self.ues.get_mut(&cfg.rnti).ok_or(LayerError::UnknownUe(cfg.rnti))?;
        ue.reconfigure(cfg);
        Ok(())
    }

    /// Remove a UE and release its uplink softbuffers
    pub fn remove_ue(&mut self, rnti: Rnti) -> Result<(), LayerError> {
        let ue = self.ues.remove(&rnti).ok_or(LayerError::UnknownUe(rnti))?;
        for harq in ue.ul_harq.iter() {
            self.softbuffers.free(SoftbufferId::new(rnti, harq.id()));
        }
        info!("Cell {} removed UE {}", self.cfg.cell_id, rnti);
        Ok(())
    }

    pub fn nof_ues(&self) -> usize {
        self.ues.len()
    }

    pub fn ue_context(&self, rnti: Rnti) -> Option<&UeContext> {
        self.ues.get(&rnti)
    }

    pub fn ue_summary(&self, rnti: Rnti) -> Option<UeSchedulingSummary> {
        self.ues.get(&rnti).map(UeContext::summary)
    }

    pub fn handle_dl_buffer_status(&mut self, rnti: Rnti, lcid: u8, bytes: u32) -> Result<(), LayerError> {
        let ue = self.ues.get_mut(&rnti).ok_or(LayerError::UnknownUe(rnti))?;
        ue.handle_dl_buffer_status(lcid, bytes);
        Ok(())
    }

    pub fn handle_bsr(&mut self, rnti: Rnti, bytes: u32) -> Result<(), LayerError> {
        let ue = self.ues.get_mut(&rnti).ok_or(LayerError::UnknownUe(rnti))?;
        ue.handle_bsr(bytes);
        Ok(())
    }

    pub fn handle_paging_request(&mut self, paging_identity: u64) {
        self.paging_queue.push_back(paging_identity);
    }

    /// Apply a PUSCH decode result to the UL HARQ process it belongs to
    pub fn handle_crc_indication(&mut self, crc: &CrcIndication) {
        let Some(ue) = self.ues.get_mut(&crc.rnti) else {
            debug!("CRC indication for unknown UE {}", crc.rnti);
            CellMetrics::inc(&self.metrics.malformed_indications);
            return;
        };
        if let Some(iterations) = crc.decoder_iterations {
            self.metrics.record_decoder_iterations(iterations);
        }
        let Some(harq) = ue.ul_harq.get_mut(crc.harq_id) else {
            warn!("CRC indication for UE {} with invalid HARQ {}", crc.rnti, crc.harq_id);
            CellMetrics::inc(&self.metrics.malformed_indications);
            return;
        };
        if harq.slot_tx() != Some(crc.slot) {
            debug!("Stale CRC indication for UE {} HARQ {} in slot {}", crc.rnti, crc.harq_id, crc.slot);
            CellMetrics::inc(&self.metrics.malformed_indications);
            return;
        }
        let id = SoftbufferId::new(crc.rnti, crc.harq_id);
        match harq.feedback(crc.crc_ok) {
            Some(HarqOutcome::Acked) => {
                CellMetrics::inc(&self.metrics.ul_crc_ok);
                self.softbuffers.free(id);
            }
            Some(HarqOutcome::RetxPending) => CellMetrics::inc(&self.metrics.ul_crc_ko),
            Some(HarqOutcome::Exhausted) => {
                CellMetrics::inc(&self.metrics.ul_crc_ko);
                CellMetrics::inc(&self.metrics.ul_harq_exhausted);
                debug!("UE {} UL HARQ {} dropped after {} retransmissions", crc.rnti, crc.harq_id, self.cfg.max_harq_retxs);
                self.softbuffers.free(id);
            }
            None => {}
        }
    }

    /// Apply HARQ-ACK feedback to the DL HARQ process it belongs to. DTX counts as NACK.
    pub fn handle_uci_indication(&mut self, uci: &UciIndication) {
        let Some(ue) = self.ues.get_mut(&uci.rnti) else {
            debug!("UCI indication for unknown UE {}", uci.rnti);
            CellMetrics::inc(&self.metrics.malformed_indications);
            return;
        };
        let Some(harq) = ue.dl_harq.get_mut(uci.harq_id) else {
            warn!("UCI indication for UE {} with invalid HARQ {}", uci.rnti, uci.harq_id);
            CellMetrics::inc(&self.metrics.malformed_indications);
            return;
        };
        if harq.slot_tx().map(|s| s + self.cfg.k1) != Some(uci.slot) {
            debug!("Stale UCI indication for UE {} HARQ {} in slot {}", uci.rnti, uci.harq_id, uci.slot);
            CellMetrics::inc(&self.metrics.malformed_indications);
            return;
        }
        match harq.feedback(uci.ack.unwrap_or(false)) {
            Some(HarqOutcome::Acked) => CellMetrics::inc(&self.metrics.dl_acks),
            Some(HarqOutcome::RetxPending) => CellMetrics::inc(&self.metrics.dl_nacks),
            Some(HarqOutcome::Exhausted) => {
                CellMetrics::inc(&self.metrics.dl_nacks);
                CellMetrics::inc(&self.metrics.dl_harq_exhausted);
            }
            None => {}
        }
    }

    /// Decide slot `slot` and hand out its PDU set.
    ///
    /// `prach` lists the PRACH occasions starting in `slot`.
    pub fn run_slot(&mut self, slot: SlotPoint, prach: &[PrachRequest]) -> SlotPduSet {
        self.grid.slot_indication(slot);
        self.expire_harq_feedback(slot);

        self.schedule_prach(slot, prach);
        self.schedule_csi_rs(slot);
        self.schedule_paging(slot);
        self.schedule_dl(slot);
        self.schedule_ul(slot);

        for ue in self.ues.values_mut() {
            ue.update_rate_averages();
        }
        CellMetrics::inc(&self.metrics.slots_processed);

        let result = self.grid.take_result(slot);
        trace!(
            "Cell {} slot {}: {} PDCCH, {} PDSCH, {} PUSCH, {} PUCCH",
            self.cfg.cell_id,
            slot,
            result.pdcch.len(),
            result.pdsch.len(),
            result.pusch.len(),
            result.pucch.len()
        );
        result
    }

    fn expire_harq_feedback(&mut self, slot: SlotPoint) {
        for ue in self.ues.values_mut() {
            let rnti = ue.rnti();
            for (_, outcome) in ue.dl_harq.slot_indication(slot) {
                CellMetrics::inc(&self.metrics.harq_feedback_timeouts);
                if outcome == HarqOutcome::Exhausted {
                    CellMetrics::inc(&self.metrics.dl_harq_exhausted);
                }
            }
            for (harq_id, outcome) in ue.ul_harq.slot_indication(slot) {
                CellMetrics::inc(&self.metrics.harq_feedback_timeouts);
                if outcome == HarqOutcome::Exhausted {
                    CellMetrics::inc(&self.metrics.ul_harq_exhausted);
                    self.softbuffers.free(SoftbufferId::new(rnti, harq_id));
                }
            }
        }
    }

    fn schedule_prach(&mut self, slot: SlotPoint, prach: &[PrachRequest]) {
        let entry = self.grid.occupancy_for(slot);
        for request in prach {
            debug_assert_eq!(request.slot, slot);
            let pdu = PrachPdu { start_symbol: request.start_symbol, nof_fd_occasions: request.nof_fd_occasions };
            if entry.result.prach.try_push(pdu).is_err() {
                warn!("Cell {} slot {}: PRACH occasion dropped, ceiling reached", self.cfg.cell_id, slot);
                CellMetrics::inc(&self.metrics.pdu_ceiling_deferrals);
            } else {
                CellMetrics::inc(&self.metrics.prach_occasions);
            }
        }
    }

    fn schedule_csi_rs(&mut self, slot: SlotPoint) {
        let Some(period) = self.cfg.csi_rs_period_slots else {
            return;
        };
        if slot.count() % period != 0 {
            return;
        }
        let entry = self.grid.occupancy_for(slot);
        let pdu = CsiRsPdu {
            resource_id: 0,
            prbs: PrbInterval::new(0, self.cfg.nof_prbs),
            symbol: SymbolRange::NOF_SYMBOLS_PER_SLOT - 1,
        };
        if entry.result.csi_rs.try_push(pdu).is_ok() {
            CellMetrics::inc(&self.metrics.csi_rs_sent);
        } else {
            CellMetrics::inc(&self.metrics.pdu_ceiling_deferrals);
        }
    }

    fn schedule_paging(&mut self, slot: SlotPoint) {
        let al = self.cfg.paging_aggregation_level;
        while let Some(&paging_identity) = self.paging_queue.front() {
            let entry = self.grid.occupancy_for(slot);
            if entry.result.paging.is_full() || entry.result.pdcch.is_full() {
                CellMetrics::inc(&self.metrics.pdu_ceiling_deferrals);
                break;
            }
            let used = entry.dl_prbs.used_prbs(self.cfg.pdsch_symbols);
            let prbs = find_empty_interval_of_length(&used, self.cfg.paging_prbs, 0);
            if prbs.length() < self.cfg.paging_prbs {
                CellMetrics::inc(&self.metrics.prb_exhaustion);
                break;
            }
            let candidates = pdcch::candidate_cces(SearchSpace::Common, slot.slot_index(), self.cfg.nof_cces, al, self.cfg.nof_candidates);
            let Some(cce) = pdcch::find_free_candidate(&entry.pdcch_cces, &candidates, al) else {
                CellMetrics::inc(&self.metrics.pdcch_exhaustion);
                break;
            };

            pdcch::allocate_candidate(&mut entry.pdcch_cces, cce, al);
            entry.dl_prbs.fill(self.cfg.pdsch_symbols, &PrbBitmap::from_interval(self.cfg.nof_prbs, prbs));
            push_pdu(
                &mut entry.result.pdcch,
                PdcchPdu { rnti: Rnti::P_RNTI, direction: Direction::Downlink, cce_index: cce, aggregation_level: al },
            );
            push_pdu(&mut entry.result.paging, PagingPdu { paging_identity, prbs });
            self.paging_queue.pop_front();
            CellMetrics::inc(&self.metrics.paging_sent);
            debug!("Cell {} slot {}: paging {:#x} on PRBs {}", self.cfg.cell_id, slot, paging_identity, prbs);
        }
    }

    fn schedule_dl(&mut self, slot: SlotPoint) {
        let mut retxs: Vec<Candidate> = self
            .ues
            .values()
            .filter_map(|ue| {
                ue.dl_harq.find_pending_retx().map(|h| Candidate {
                    boost: false,
                    priority: self.policy.dl_priority(ue, slot),
                    rnti: ue.rnti(),
                    retx: Some(h),
                })
            })
            .collect();
        sort_candidates(&mut retxs);

        let mut new_txs: Vec<Candidate> = self
            .ues
            .values()
            .filter(|ue| {
                ue.pending_dl_bytes() > 0
                    && ue.dl_harq.find_empty().is_some()
                    && ue.dl_harq.find_pending_retx().is_none()
            })
            .map(|ue| Candidate {
                boost: false,
                priority: self.policy.dl_priority(ue, slot),
                rnti: ue.rnti(),
                retx: None,
            })
            .collect();
        sort_candidates(&mut new_txs);

        let candidates: Vec<Candidate> = retxs.into_iter().chain(new_txs).collect();
        for (i, candidate) in candidates.iter().enumerate() {
            if self.try_dl_grant(slot, candidate.rnti, candidate.retx) == GrantOutcome::CeilingReached {
                CellMetrics::add(&self.metrics.pdu_ceiling_deferrals, (candidates.len() - i) as u64);
                break;
            }
        }
    }

    fn try_dl_grant(&mut self, slot: SlotPoint, rnti: Rnti, retx: Option<HarqId>) -> GrantOutcome {
        let ack_slot = slot + self.cfg.k1;
        {
            let entry = self.grid.occupancy_for(slot);
            if entry.result.pdcch.is_full() || entry.result.pdsch.is_full() {
                return GrantOutcome::CeilingReached;
            }
        }
        if self.grid.occupancy_for(ack_slot).result.pucch.is_full() {
            return GrantOutcome::CeilingReached;
        }
        let Some(ue) = self.ues.get_mut(&rnti) else {
            return GrantOutcome::Skipped;
        };
        let ue_cfg = ue.config().clone();

        let (harq_id, nof_prbs, fixed_tbs) = match retx {
            Some(harq_id) => match ue.dl_harq.get(harq_id) {
                Some(harq) => (harq_id, harq.nof_prbs(), Some(harq.tbs_bytes())),
                None => return GrantOutcome::Skipped,
            },
            None => match ue.dl_harq.find_empty() {
                Some(harq_id) => {
                    let wanted = ue.pending_dl_bytes().div_ceil(ue_cfg.dl_bytes_per_prb) as usize;
                    (harq_id, wanted.clamp(ue_cfg.min_prbs, ue_cfg.max_prbs), None)
                }
                None => return GrantOutcome::Skipped,
            },
        };
        let min_prbs = if fixed_tbs.is_some() { nof_prbs } else { ue_cfg.min_prbs };

        // Frequency domain
        let used = self.grid.occupancy_for(slot).dl_prbs.used_prbs(self.cfg.pdsch_symbols);
        let (grant, granted_prbs) = match ue_cfg.dl_alloc_type {
            AllocationType::Type1 => {
                let prbs = find_empty_interval_of_length(&used, nof_prbs, 0);
                (PrbGrant::Interval(prbs), prbs.length())
            }
            AllocationType::Type0 => {
                let (rbgs, covered) = select_rbgs(&self.rbg_cfg, &used, nof_prbs);
                (PrbGrant::Rbgs(rbgs), covered)
            }
        };
        if granted_prbs < min_prbs || granted_prbs == 0 {
            CellMetrics::inc(&self.metrics.prb_exhaustion);
            return GrantOutcome::NoPrbs;
        }
        let prb_mask = grant.to_prb_mask(&self.rbg_cfg);

        // PDCCH
        let al = ue_cfg.aggregation_level;
        let candidates =
            pdcch::candidate_cces(SearchSpace::UeSpecific(rnti), slot.slot_index(), self.cfg.nof_cces, al, self.cfg.nof_candidates);
        let Some(cce) = pdcch::find_free_candidate(&self.grid.occupancy_for(slot).pdcch_cces, &candidates, al) else {
            CellMetrics::inc(&self.metrics.pdcch_exhaustion);
            return GrantOutcome::NoPdcch;
        };

        // PUCCH for the HARQ-ACK, highest free PRB
        let pucch_used = self.grid.occupancy_for(ack_slot).ul_prbs.used_prbs(self.cfg.pucch_symbols);
        let Some(pucch_prb) = (0..self.cfg.nof_prbs).rev().find(|&prb| !pucch_used.test(prb)) else {
            CellMetrics::inc(&self.metrics.prb_exhaustion);
            return GrantOutcome::NoPrbs;
        };

        // Commit
        let tbs_bytes = fixed_tbs.unwrap_or_else(|| ue.pending_dl_bytes().min(granted_prbs as u32 * ue_cfg.dl_bytes_per_prb));
        let deadline = ack_slot + self.cfg.harq_feedback_timeout_slots;
        let Some(harq) = ue.dl_harq.get_mut(harq_id) else {
            return GrantOutcome::Skipped;
        };
        if fixed_tbs.is_some() {
            harq.new_retx(slot, deadline, grant);
            CellMetrics::inc(&self.metrics.dl_retx);
        } else {
            harq.new_tx(slot, deadline, tbs_bytes, grant, granted_prbs);
            CellMetrics::inc(&self.metrics.dl_new_tx);
        }
        let pdsch = PdschPdu {
            rnti,
            harq_id: Some(harq_id),
            grant,
            symbols: self.cfg.pdsch_symbols,
            tbs_bytes,
            rv: harq.rv(),
            ndi: harq.ndi(),
            new_data: fixed_tbs.is_none(),
        };
        if fixed_tbs.is_none() {
            ue.consume_dl_bytes(tbs_bytes);
        }
        ue.set_last_dl_grant(grant, slot);

        let entry = self.grid.occupancy_for(slot);
        pdcch::allocate_candidate(&mut entry.pdcch_cces, cce, al);
        entry.dl_prbs.fill(self.cfg.pdsch_symbols, &prb_mask);
        push_pdu(&mut entry.result.pdcch, PdcchPdu { rnti, direction: Direction::Downlink, cce_index: cce, aggregation_level: al });
        push_pdu(&mut entry.result.pdsch, pdsch);

        let ack_entry = self.grid.occupancy_for(ack_slot);
        let mut pucch_mask = PrbBitmap::new(self.cfg.nof_prbs);
        pucch_mask.set(pucch_prb);
        ack_entry.ul_prbs.fill(self.cfg.pucch_symbols, &pucch_mask);
        push_pdu(&mut ack_entry.result.pucch, PucchPdu { rnti, harq_id, prb: pucch_prb as u16 });

        trace!("DL grant UE {} HARQ {} in {}: {} ({} bytes)", rnti, harq_id, slot, grant, tbs_bytes);
        GrantOutcome::Allocated
    }

    fn schedule_ul(&mut self, slot: SlotPoint) {
        let mut retxs: Vec<Candidate> = self
            .ues
            .values()
            .filter_map(|ue| {
                ue.ul_harq.find_pending_retx().map(|h| Candidate {
                    boost: ue.ul_priority_boost(),
                    priority: self.policy.ul_priority(ue, slot),
                    rnti: ue.rnti(),
                    retx: Some(h),
                })
            })
            .collect();
        sort_candidates(&mut retxs);

        let mut new_txs: Vec<Candidate> = self
            .ues
            .values()
            .filter(|ue| {
                ue.pending_ul_bytes() > 0
                    && ue.ul_harq.find_empty().is_some()
                    && ue.ul_harq.find_pending_retx().is_none()
            })
            .map(|ue| Candidate {
                boost: ue.ul_priority_boost(),
                priority: self.policy.ul_priority(ue, slot),
                rnti: ue.rnti(),
                retx: None,
            })
            .collect();
        sort_candidates(&mut new_txs);

        let candidates: Vec<Candidate> = retxs.into_iter().chain(new_txs).collect();
        for (i, candidate) in candidates.iter().enumerate() {
            if self.try_ul_grant(slot, candidate.rnti, candidate.retx) == GrantOutcome::CeilingReached {
                CellMetrics::add(&self.metrics.pdu_ceiling_deferrals, (candidates.len() - i) as u64);
                break;
            }
        }
    }

    fn try_ul_grant(&mut self, slot: SlotPoint, rnti: Rnti, retx: Option<HarqId>) -> GrantOutcome {
        let pusch_slot = slot + self.cfg.k2;
        if self.grid.occupancy_for(slot).result.pdcch.is_full()
            || self.grid.occupancy_for(pusch_slot).result.pusch.is_full()
        {
            return GrantOutcome::CeilingReached;
        }
        let Some(ue) = self.ues.get_mut(&rnti) else {
            return GrantOutcome::Skipped;
        };
        let ue_cfg = ue.config().clone();

        let (harq_id, nof_prbs, fixed_tbs) = match retx {
            Some(harq_id) => match ue.ul_harq.get(harq_id) {
                Some(harq) => (harq_id, harq.nof_prbs(), Some(harq.tbs_bytes())),
                None => return GrantOutcome::Skipped,
            },
            None => match ue.ul_harq.find_empty() {
                Some(harq_id) => {
                    let wanted = ue.pending_ul_bytes().div_ceil(ue_cfg.ul_bytes_per_prb) as usize;
                    (harq_id, wanted.clamp(ue_cfg.min_prbs, ue_cfg.max_prbs), None)
                }
                None => return GrantOutcome::Skipped,
            },
        };
        let min_prbs = if fixed_tbs.is_some() { nof_prbs } else { ue_cfg.min_prbs };

        let used = self.grid.occupancy_for(pusch_slot).ul_prbs.used_prbs(self.cfg.pusch_symbols);
        let prbs = find_empty_interval_of_length(&used, nof_prbs, 0);
        if prbs.length() < min_prbs || prbs.is_empty() {
            CellMetrics::inc(&self.metrics.prb_exhaustion);
            return GrantOutcome::NoPrbs;
        }

        let al = ue_cfg.aggregation_level;
        let candidates =
            pdcch::candidate_cces(SearchSpace::UeSpecific(rnti), slot.slot_index(), self.cfg.nof_cces, al, self.cfg.nof_candidates);
        let Some(cce) = pdcch::find_free_candidate(&self.grid.occupancy_for(slot).pdcch_cces, &candidates, al) else {
            CellMetrics::inc(&self.metrics.pdcch_exhaustion);
            return GrantOutcome::NoPdcch;
        };

        let tbs_bytes = fixed_tbs.unwrap_or_else(|| ue.pending_ul_bytes().min(prbs.length() as u32 * ue_cfg.ul_bytes_per_prb));
        let nof_codeblocks = ldpc_nof_codeblocks(tbs_bytes * 8);

        // The decode buffer must exist before the UE is told to transmit.
        let softbuffer_id = SoftbufferId::new(rnti, harq_id);
        match self.softbuffers.reserve(pusch_slot, softbuffer_id, nof_codeblocks as usize) {
            Ok(handle) => handle.release(),
            Err(err) => {
                debug!("UE {} UL grant in {} skipped: {}", rnti, slot, err);
                CellMetrics::inc(&self.metrics.softbuffer_exhaustion);
                ue.set_ul_priority_boost(true);
                return GrantOutcome::NoSoftbuffer;
            }
        }

        let grant = PrbGrant::Interval(prbs);
        let deadline = pusch_slot + self.cfg.harq_feedback_timeout_slots;
        let Some(harq) = ue.ul_harq.get_mut(harq_id) else {
            return GrantOutcome::Skipped;
        };
        if fixed_tbs.is_some() {
            harq.new_retx(pusch_slot, deadline, grant);
            CellMetrics::inc(&self.metrics.ul_retx);
        } else {
            harq.new_tx(pusch_slot, deadline, tbs_bytes, grant, prbs.length());
            CellMetrics::inc(&self.metrics.ul_new_tx);
        }
        let pusch = PuschPdu {
            rnti,
            harq_id,
            prbs,
            symbols: self.cfg.pusch_symbols,
            tbs_bytes,
            rv: harq.rv(),
            ndi: harq.ndi(),
            new_data: fixed_tbs.is_none(),
            nof_codeblocks,
        };
        if fixed_tbs.is_none() {
            ue.consume_ul_bytes(tbs_bytes);
        }
        ue.set_last_ul_grant(grant, slot);
        ue.set_ul_priority_boost(false);

        let entry = self.grid.occupancy_for(slot);
        pdcch::allocate_candidate(&mut entry.pdcch_cces, cce, al);
        push_pdu(&mut entry.result.pdcch, PdcchPdu { rnti, direction: Direction::Uplink, cce_index: cce, aggregation_level: al });

        let pusch_entry = self.grid.occupancy_for(pusch_slot);
        pusch_entry.ul_prbs.fill(self.cfg.pusch_symbols, &PrbBitmap::from_interval(self.cfg.nof_prbs, prbs));
        push_pdu(&mut pusch_entry.result.pusch, pusch);

        trace!("UL grant UE {} HARQ {} for {}: {} ({} bytes, {} CBs)", rnti, harq_id, pusch_slot, prbs, tbs_bytes, nof_codeblocks);
        GrantOutcome::Allocated
    }
}
