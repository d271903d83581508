//! Scheduling Policies
//!
//! A policy only ranks UEs. Resource search, PDCCH placement and commit stay in
//! the cell scheduler regardless of which policy is plugged in.

use super::ue::UeContext;
use common::SlotPoint;
use serde::{Deserialize, Serialize};

/// Ranks UEs competing for the resources of a slot. Higher goes first.
pub trait SchedulingPolicy: Send {
    fn name(&self) -> &'static str;

    fn dl_priority(&self, ue: &UeContext, slot: SlotPoint) -> f64;

    fn ul_priority(&self, ue: &UeContext, slot: SlotPoint) -> f64;
}

/// Selectable policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    RoundRobin,
    ProportionalFair,
}

impl PolicyKind {
    pub fn create(self) -> Box<dyn SchedulingPolicy> {
        match self {
            PolicyKind::RoundRobin => Box::new(RoundRobinPolicy),
            PolicyKind::ProportionalFair => Box::new(ProportionalFairPolicy::default()),
        }
    }
}

/// Serves the UE that waited longest since its last grant. Never-served UEs go first.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy;

impl RoundRobinPolicy {
    fn rank(last_served: Option<SlotPoint>, slot: SlotPoint) -> f64 {
        match last_served {
            Some(last) => (slot - last) as f64,
            None => f64::MAX,
        }
    }
}

impl SchedulingPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn dl_priority(&self, ue: &UeContext, slot: SlotPoint) -> f64 {
        Self::rank(ue.last_dl_slot(), slot)
    }

    fn ul_priority(&self, ue: &UeContext, slot: SlotPoint) -> f64 {
        Self::rank(ue.last_ul_slot(), slot)
    }
}

/// Achievable rate over average served rate
#[derive(Debug)]
pub struct ProportionalFairPolicy {
    /// Floor of the average rate, keeps new UEs from dividing by zero
    pub min_avg_rate: f64,
}

impl Default for ProportionalFairPolicy {
    fn default() -> Self {
        Self { min_avg_rate: 1.0 }
    }
}

impl SchedulingPolicy for ProportionalFairPolicy {
    fn name(&self) -> &'static str {
        "proportional_fair"
    }

    fn dl_priority(&self, ue: &UeContext, _slot: SlotPoint) -> f64 {
        let cfg = ue.config();
        let achievable = (cfg.dl_bytes_per_prb as usize * cfg.max_prbs) as f64;
        achievable / ue.avg_dl_rate().max(self.min_avg_rate)
    }

    fn ul_priority(&self, ue: &UeContext, _slot: SlotPoint) -> f64 {
        let cfg = ue.config();
        let achievable = (cfg.ul_bytes_per_prb as usize * cfg.max_prbs) as f64;
        achievable / ue.avg_ul_rate().max(self.min_avg_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::ue::UeConfig;
    use common::Rnti;

    fn ue(rnti: u16) -> UeContext {
        UeContext::new(UeConfig::new(Rnti(rnti)), 8, 4)
    }

    #[test]
    fn test_round_robin_serves_longest_waiting() {
        use common::PrbInterval;
        let policy = RoundRobinPolicy;
        let slot = SlotPoint::new(0, 10, 0);
        let mut recent = ue(0x4601);
        let mut earlier = ue(0x4602);
        let never = ue(0x4603);
        recent.set_last_dl_grant(PrbInterval::new(0, 4).into(), slot - 1);
        earlier.set_last_dl_grant(PrbInterval::new(0, 4).into(), slot - 7);

        let mut order = [&recent, &earlier, &never];
        order.sort_by(|a, b| policy.dl_priority(b, slot).total_cmp(&policy.dl_priority(a, slot)));
        let rntis: Vec<u16> = order.iter().map(|ue| ue.rnti().value()).collect();
        assert_eq!(rntis, vec![0x4603, 0x4602, 0x4601]);
        assert_eq!(policy.ul_priority(&recent, slot), f64::MAX);
    }

    #[test]
    fn test_proportional_fair_favours_starved_ue() {
        let policy = ProportionalFairPolicy::default();
        let mut served = ue(0x4601);
        let starved = ue(0x4602);
        served.handle_dl_buffer_status(1, 1_000_000);
        for _ in 0..50 {
            served.consume_dl_bytes(1_000);
            served.update_rate_averages();
        }
        let slot = SlotPoint::new(0, 0, 0);
        assert!(policy.dl_priority(&starved, slot) > policy.dl_priority(&served, slot));
    }

    #[test]
    fn test_policy_kind_deserialize() {
        let kind: PolicyKind = serde_json::from_str("\"proportional_fair\"").unwrap();
        assert_eq!(kind.create().name(), "proportional_fair");
    }
}
