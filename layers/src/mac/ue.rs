//! UE Scheduling Context
//!
//! Everything the cell scheduler keeps per connected UE: link parameters,
//! buffer state, HARQ entities and rate history for the scheduling policy.

use super::harq::HarqEntity;
use crate::LayerError;
use common::{PrbGrant, Rnti, SlotPoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Forgetting factor of the average rate filter
const RATE_AVERAGING_FACTOR: f64 = 0.05;

/// Downlink frequency-domain resource allocation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationType {
    /// RBG bitmap
    Type0,
    /// Contiguous PRB interval
    Type1,
}

/// Per-UE link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UeConfig {
    pub rnti: Rnti,
    pub dl_alloc_type: AllocationType,
    /// Bytes carried per PRB at the UE's current DL link quality
    pub dl_bytes_per_prb: u32,
    /// Bytes carried per PRB at the UE's current UL link quality
    pub ul_bytes_per_prb: u32,
    /// Smallest grant worth scheduling
    pub min_prbs: usize,
    /// Largest grant per slot
    pub max_prbs: usize,
    /// PDCCH aggregation level
    pub aggregation_level: u8,
}

impl UeConfig {
    /// Config with moderate link quality for `rnti`
    pub fn new(rnti: Rnti) -> Self {
        Self {
            rnti,
            dl_alloc_type: AllocationType::Type1,
            dl_bytes_per_prb: 60,
            ul_bytes_per_prb: 40,
            min_prbs: 1,
            max_prbs: 273,
            aggregation_level: 2,
        }
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        if !self.rnti.is_crnti() {
            return Err(LayerError::InvalidConfiguration(format!("{} is not a C-RNTI", self.rnti)));
        }
        if self.min_prbs == 0 || self.min_prbs > self.max_prbs {
            return Err(LayerError::InvalidConfiguration(format!(
                "UE {} PRB limits [{}, {}] invalid", self.rnti, self.min_prbs, self.max_prbs
            )));
        }
        if self.dl_bytes_per_prb == 0 || self.ul_bytes_per_prb == 0 {
            return Err(LayerError::InvalidConfiguration(format!("UE {} link rate is zero", self.rnti)));
        }
        if !super::pdcch::AGGREGATION_LEVELS.contains(&self.aggregation_level) {
            return Err(LayerError::InvalidConfiguration(format!(
                "UE {} aggregation level {} invalid", self.rnti, self.aggregation_level
            )));
        }
        Ok(())
    }
}

/// Scheduling state of one UE
#[derive(Debug, Clone)]
pub struct UeContext {
    cfg: UeConfig,
    pub dl_harq: HarqEntity,
    pub ul_harq: HarqEntity,
    /// DL bytes pending per logical channel
    dl_pending: BTreeMap<u8, u32>,
    /// UL bytes last reported by BSR, minus what was granted since
    ul_pending: u32,
    last_dl_grant: Option<PrbGrant>,
    last_ul_grant: Option<PrbGrant>,
    last_dl_slot: Option<SlotPoint>,
    last_ul_slot: Option<SlotPoint>,
    ul_priority_boost: bool,
    avg_dl_rate: f64,
    avg_ul_rate: f64,
    dl_bytes_slot: u32,
    ul_bytes_slot: u32,
}

/// Read-only summary handed out to collaborators
#[derive(Debug, Clone, Serialize)]
pub struct UeSchedulingSummary {
    pub rnti: Rnti,
    pub dl_pending_bytes: u32,
    pub ul_pending_bytes: u32,
    pub dl_harqs_busy: usize,
    pub ul_harqs_busy: usize,
    pub avg_dl_rate: f64,
    pub avg_ul_rate: f64,
    pub ul_priority_boost: bool,
}

impl UeContext {
    pub fn new(cfg: UeConfig, nof_harqs: usize, max_harq_retxs: u32) -> Self {
        Self {
            cfg,
            dl_harq: HarqEntity::new(nof_harqs, max_harq_retxs),
            ul_harq: HarqEntity::new(nof_harqs, max_harq_retxs),
            dl_pending: BTreeMap::new(),
            ul_pending: 0,
            last_dl_grant: None,
            last_ul_grant: None,
            last_dl_slot: None,
            last_ul_slot: None,
            ul_priority_boost: false,
            avg_dl_rate: 0.0,
            avg_ul_rate: 0.0,
            dl_bytes_slot: 0,
            ul_bytes_slot: 0,
        }
    }

    pub fn rnti(&self) -> Rnti {
        self.cfg.rnti
    }

    pub fn config(&self) -> &UeConfig {
        &self.cfg
    }

    /// Replace the link parameters, keeping buffers and HARQ state
    pub fn reconfigure(&mut self, cfg: UeConfig) {
        debug_assert_eq!(cfg.rnti, self.cfg.rnti);
        self.cfg = cfg;
    }

    /// DL buffer occupancy report from RLC for one logical channel
    pub fn handle_dl_buffer_status(&mut self, lcid: u8, bytes: u32) {
        if bytes == 0 {
            self.dl_pending.remove(&lcid);
        } else {
            self.dl_pending.insert(lcid, bytes);
        }
    }

    /// UL buffer status report
    pub fn handle_bsr(&mut self, bytes: u32) {
        self.ul_pending = bytes;
    }

    /// DL bytes pending over all logical channels, saturating at `u32::MAX`
    pub fn pending_dl_bytes(&self) -> u32 {
        self.dl_pending.values().fold(0u32, |total, &bytes| total.saturating_add(bytes))
    }

    pub fn pending_ul_bytes(&self) -> u32 {
        self.ul_pending
    }

    /// Drain `bytes` from the DL buffers, lowest LCID first
    pub fn consume_dl_bytes(&mut self, mut bytes: u32) {
        self.dl_bytes_slot += bytes;
        let lcids: Vec<u8> = self.dl_pending.keys().copied().collect();
        for lcid in lcids {
            if bytes == 0 {
                break;
            }
            if let Some(pending) = self.dl_pending.get_mut(&lcid) {
                let served = (*pending).min(bytes);
                *pending -= served;
                bytes -= served;
                if *pending == 0 {
                    self.dl_pending.remove(&lcid);
                }
            }
        }
    }

    pub fn consume_ul_bytes(&mut self, bytes: u32) {
        self.ul_bytes_slot += bytes;
        self.ul_pending = self.ul_pending.saturating_sub(bytes);
    }

    pub fn last_dl_grant(&self) -> Option<&PrbGrant> {
        self.last_dl_grant.as_ref()
    }

    pub fn last_ul_grant(&self) -> Option<&PrbGrant> {
        self.last_ul_grant.as_ref()
    }

    /// Slot of the last DL grant
    pub fn last_dl_slot(&self) -> Option<SlotPoint> {
        self.last_dl_slot
    }

    /// Slot of the last UL grant's DCI
    pub fn last_ul_slot(&self) -> Option<SlotPoint> {
        self.last_ul_slot
    }

    pub fn set_last_dl_grant(&mut self, grant: PrbGrant, slot: SlotPoint) {
        self.last_dl_grant = Some(grant);
        self.last_dl_slot = Some(slot);
    }

    pub fn set_last_ul_grant(&mut self, grant: PrbGrant, slot: SlotPoint) {
        self.last_ul_grant = Some(grant);
        self.last_ul_slot = Some(slot);
    }

    /// Whether the UE lost an UL opportunity and goes first next slot
    pub fn ul_priority_boost(&self) -> bool {
        self.ul_priority_boost
    }

    pub fn set_ul_priority_boost(&mut self, boost: bool) {
        self.ul_priority_boost = boost;
    }

    pub fn avg_dl_rate(&self) -> f64 {
        self.avg_dl_rate
    }

    pub fn avg_ul_rate(&self) -> f64 {
        self.avg_ul_rate
    }

    /// Fold this slot's served bytes into the average rates
    pub fn update_rate_averages(&mut self) {
        self.avg_dl_rate += RATE_AVERAGING_FACTOR * (self.dl_bytes_slot as f64 - self.avg_dl_rate);
        self.avg_ul_rate += RATE_AVERAGING_FACTOR * (self.ul_bytes_slot as f64 - self.avg_ul_rate);
        self.dl_bytes_slot = 0;
        self.ul_bytes_slot = 0;
    }

    pub fn summary(&self) -> UeSchedulingSummary {
        UeSchedulingSummary {
            rnti: self.cfg.rnti,
            dl_pending_bytes: self.pending_dl_bytes(),
            ul_pending_bytes: self.ul_pending,
            dl_harqs_busy: self.dl_harq.iter().filter(|h| !h.is_empty()).count(),
            ul_harqs_busy: self.ul_harq.iter().filter(|h| !h.is_empty()).count(),
            avg_dl_rate: self.avg_dl_rate,
            avg_ul_rate: self.avg_ul_rate,
            ul_priority_boost: self.ul_priority_boost,
        }
    }
}
