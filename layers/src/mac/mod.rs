//! Medium Access Control (MAC) Scheduling
//!
//! Slot scheduling for 5G NR per 3GPP TS 38.321 / 38.213 / 38.214: resource grid
//! occupancy, PDCCH candidate placement, HARQ, per-UE context and the pluggable
//! policy that orders UEs within a slot.

pub mod harq;
pub mod pdcch;
pub mod policy;
pub mod resource_grid;
pub mod scheduler;
pub mod ue;

pub use harq::{HarqEntity, HarqOutcome, HarqProcess, HarqState};
pub use policy::{PolicyKind, ProportionalFairPolicy, RoundRobinPolicy, SchedulingPolicy};
pub use resource_grid::{CellResourceAllocator, ResourceGridConfig, SlotResources};
pub use scheduler::{CellScheduler, CellSchedulerConfig};
pub use ue::{AllocationType, UeConfig, UeContext, UeSchedulingSummary};
