//! Timing Violation Logging

use common::{CellId, SlotPoint};
use interfaces::{SlotErrorContext, SlotErrorNotifier};
use tracing::warn;

/// Reports every timing violation as a warning
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorNotifier;

impl SlotErrorNotifier for LoggingErrorNotifier {
    fn on_late_slot_result(&self, cell: CellId, slot: SlotPoint) {
        warn!("Cell {}: slot {} result late, discarded", cell, slot);
    }

    fn on_late_slot_indication(&self, cell: CellId, slot: SlotPoint, last: SlotPoint) {
        warn!("Cell {}: slot indication {} not after {}, ignored", cell, slot, last);
    }

    fn on_request_late(&self, context: SlotErrorContext) {
        warn!("Cell {}: late {} request for slot {}", context.cell, context.channel, context.slot);
    }

    fn on_request_overflow(&self, context: SlotErrorContext) {
        warn!("Cell {}: {} request queue full, request for slot {} dropped", context.cell, context.channel, context.slot);
    }
}
