//! HARQ Processes
//!
//! Per-UE, per-direction HARQ entities. A process is either empty or awaiting
//! feedback; a NACK (or a feedback deadline passing) leaves it awaiting feedback
//! with a retransmission pending until the retransmission budget runs out.

use common::{HarqId, PrbGrant, SlotPoint};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Redundancy version sequence across transmissions
pub const RV_SEQUENCE: [u8; 4] = [0, 2, 3, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarqState {
    Empty,
    AwaitingFeedback,
}

/// What a feedback event did to a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqOutcome {
    /// Transport block delivered, process emptied
    Acked,
    /// NACK within budget, retransmission pending
    RetxPending,
    /// NACK with the budget spent, process emptied and the block lost
    Exhausted,
}

/// One HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess {
    id: HarqId,
    state: HarqState,
    max_retxs: u32,
    nof_retxs: u32,
    ndi: bool,
    retx_pending: bool,
    tbs_bytes: u32,
    nof_prbs: usize,
    grant: Option<PrbGrant>,
    slot_tx: Option<SlotPoint>,
    feedback_deadline: Option<SlotPoint>,
}

impl HarqProcess {
    pub fn new(id: HarqId, max_retxs: u32) -> Self {
        Self {
            id,
            state: HarqState::Empty,
            max_retxs,
            nof_retxs: 0,
            ndi: false,
            retx_pending: false,
            tbs_bytes: 0,
            nof_prbs: 0,
            grant: None,
            slot_tx: None,
            feedback_deadline: None,
        }
    }

    pub fn id(&self) -> HarqId {
        self.id
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.state == HarqState::Empty
    }

    /// Awaiting feedback for the last transmission
    pub fn is_waiting_ack(&self) -> bool {
        self.state == HarqState::AwaitingFeedback && !self.retx_pending
    }

    pub fn has_pending_retx(&self) -> bool {
        self.state == HarqState::AwaitingFeedback && self.retx_pending
    }

    pub fn ndi(&self) -> bool {
        self.ndi
    }

    /// Redundancy version of the current transmission
    pub fn rv(&self) -> u8 {
        RV_SEQUENCE[self.nof_retxs as usize % RV_SEQUENCE.len()]
    }

    pub fn nof_retxs(&self) -> u32 {
        self.nof_retxs
    }

    pub fn tbs_bytes(&self) -> u32 {
        self.tbs_bytes
    }

    /// PRBs of the original transmission, reused by retransmissions
    pub fn nof_prbs(&self) -> usize {
        self.nof_prbs
    }

    pub fn last_grant(&self) -> Option<&PrbGrant> {
        self.grant.as_ref()
    }

    pub fn slot_tx(&self) -> Option<SlotPoint> {
        self.slot_tx
    }

    /// Start a new transport block. The NDI toggles.
    pub fn new_tx(&mut self, slot_tx: SlotPoint, deadline: SlotPoint, tbs_bytes: u32, grant: PrbGrant, nof_prbs: usize) {
        assert!(self.is_empty(), "new transmission on busy HARQ {}", self.id);
        self.state = HarqState::AwaitingFeedback;
        self.nof_retxs = 0;
        self.ndi = !self.ndi;
        self.retx_pending = false;
        self.tbs_bytes = tbs_bytes;
        self.nof_prbs = nof_prbs;
        self.grant = Some(grant);
        self.slot_tx = Some(slot_tx);
        self.feedback_deadline = Some(deadline);
    }

    /// Retransmit the pending transport block. NDI and TBS stay, the RV advances.
    pub fn new_retx(&mut self, slot_tx: SlotPoint, deadline: SlotPoint, grant: PrbGrant) {
        assert!(self.has_pending_retx(), "retransmission on HARQ {} without pending NACK", self.id);
        self.nof_retxs += 1;
        self.retx_pending = false;
        self.grant = Some(grant);
        self.slot_tx = Some(slot_tx);
        self.feedback_deadline = Some(deadline);
    }

    /// Apply ACK/NACK feedback. Feedback while not awaiting any is ignored.
    pub fn feedback(&mut self, ack: bool) -> Option<HarqOutcome> {
        if !self.is_waiting_ack() {
            debug!("HARQ {} ignoring feedback in state {:?}", self.id, self.state);
            return None;
        }
        if ack {
            self.reset();
            Some(HarqOutcome::Acked)
        } else if self.nof_retxs < self.max_retxs {
            self.retx_pending = true;
            Some(HarqOutcome::RetxPending)
        } else {
            self.reset();
            Some(HarqOutcome::Exhausted)
        }
    }

    /// Treat a missed feedback deadline as NACK
    pub fn check_timeout(&mut self, slot: SlotPoint) -> Option<HarqOutcome> {
        match self.feedback_deadline {
            Some(deadline) if self.is_waiting_ack() && slot > deadline => self.feedback(false),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.state = HarqState::Empty;
        self.retx_pending = false;
        self.nof_retxs = 0;
        self.grant = None;
        self.slot_tx = None;
        self.feedback_deadline = None;
    }
}

/// HARQ processes of one UE in one direction
#[derive(Debug, Clone)]
pub struct HarqEntity {
    processes: Vec<HarqProcess>,
}

impl HarqEntity {
    pub fn new(nof_processes: usize, max_retxs: u32) -> Self {
        assert!(nof_processes > 0 && nof_processes <= HarqId::MAX_NOF_HARQS);
        let processes = (0..nof_processes)
            .map(|i| HarqProcess::new(HarqId(i as u8), max_retxs))
            .collect();
        Self { processes }
    }

    pub fn nof_processes(&self) -> usize {
        self.processes.len()
    }

    pub fn get(&self, id: HarqId) -> Option<&HarqProcess> {
        self.processes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: HarqId) -> Option<&mut HarqProcess> {
        self.processes.get_mut(id.0 as usize)
    }

    pub fn find_empty(&self) -> Option<HarqId> {
        self.processes.iter().find(|p| p.is_empty()).map(|p| p.id)
    }

    /// Pending retransmission with the oldest original transmission
    pub fn find_pending_retx(&self) -> Option<HarqId> {
        self.processes
            .iter()
            .filter(|p| p.has_pending_retx())
            .min_by(|a, b| a.slot_tx.partial_cmp(&b.slot_tx).unwrap_or(Ordering::Equal))
            .map(|p| p.id)
    }

    /// Expire overdue feedback as NACKs
    pub fn slot_indication(&mut self, slot: SlotPoint) -> Vec<(HarqId, HarqOutcome)> {
        self.processes
            .iter_mut()
            .filter_map(|p| p.check_timeout(slot).map(|outcome| (p.id, outcome)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HarqProcess> {
        self.processes.iter()
    }
}
