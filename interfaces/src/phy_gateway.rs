//! PHY Gateway Traits
//!
//! Narrow contracts between the slot scheduling core and its collaborators.

use crate::slot_result::{ChannelType, SlotPduSet};
use common::{CellId, SlotPoint};
use serde::Serialize;

/// Receives the PDU set of a cell once its slot decision is committed
pub trait SlotResultSink: Send + Sync {
    fn on_new_slot_result(&self, cell: CellId, result: SlotPduSet);
}

/// Where and what a timing violation concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotErrorContext {
    pub cell: CellId,
    pub slot: SlotPoint,
    pub channel: ChannelType,
}

/// Notified of non-fatal timing violations. The offending item is already dropped.
pub trait SlotErrorNotifier: Send + Sync {
    /// A slot result was produced after its slot started over the air
    fn on_late_slot_result(&self, cell: CellId, slot: SlotPoint);

    /// A slot indication did not advance past the previous one `last`
    fn on_late_slot_indication(&self, cell: CellId, slot: SlotPoint, last: SlotPoint);

    /// A request targeted a slot whose processing window already began
    fn on_request_late(&self, context: SlotErrorContext);

    /// A request queue for a channel type was full
    fn on_request_overflow(&self, context: SlotErrorContext);
}

/// Runs submitted work on some execution context
pub trait TaskExecutor: Send + Sync {
    /// Submit a task. Returns `false` if the executor refused it.
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) -> bool;
}
