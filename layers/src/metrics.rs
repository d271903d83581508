//! Cell Metrics
//!
//! Lock-free counters updated from the scheduling and dispatch paths, readable
//! at any time as a serializable snapshot.

use common::CellId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! cell_counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Counters of one cell
        #[derive(Debug, Default)]
        pub struct CellMetrics {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`CellMetrics`]
        #[derive(Debug, Clone, Default, PartialEq, Serialize)]
        pub struct CellMetricsSnapshot {
            pub cell: Option<CellId>,
            $(pub $name: u64,)*
            /// Mean LDPC decoder iterations over reported CRCs
            pub avg_decoder_iterations: f64,
        }

        impl CellMetrics {
            pub fn snapshot(&self) -> CellMetricsSnapshot {
                let mut snapshot = CellMetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                    ..Default::default()
                };
                if snapshot.decoder_iteration_samples > 0 {
                    snapshot.avg_decoder_iterations =
                        snapshot.decoder_iterations_total as f64 / snapshot.decoder_iteration_samples as f64;
                }
                snapshot
            }
        }
    };
}

cell_counters! {
    /// Slot decisions committed
    slots_processed,
    /// Slot indications dropped because the previous decision was still running
    slots_skipped,
    /// Slot results dropped for being late
    late_slot_results,
    /// Slot indications dropped for repeating or preceding an earlier one
    late_slot_indications,
    /// Requests dropped for targeting a slot already being processed
    late_requests,
    /// Requests dropped on a full queue
    request_overflows,
    /// Slot tasks the executor refused
    executor_rejections,
    dl_new_tx,
    dl_retx,
    ul_new_tx,
    ul_retx,
    dl_acks,
    dl_nacks,
    ul_crc_ok,
    ul_crc_ko,
    /// CRC or HARQ-ACK indications for an unknown UE, HARQ process or slot
    malformed_indications,
    /// HARQ feedback deadlines missed
    harq_feedback_timeouts,
    /// DL transport blocks lost after the retransmission budget ran out
    dl_harq_exhausted,
    /// UL transport blocks lost after the retransmission budget ran out
    ul_harq_exhausted,
    /// Grants skipped for lack of free PRBs
    prb_exhaustion,
    /// Grants skipped for lack of a free PDCCH candidate
    pdcch_exhaustion,
    /// UL grants skipped because no softbuffer could be reserved
    softbuffer_exhaustion,
    /// Grants or PDUs deferred by a per-slot ceiling
    pdu_ceiling_deferrals,
    paging_sent,
    csi_rs_sent,
    prach_occasions,
    decoder_iterations_total,
    decoder_iteration_samples,
}

impl CellMetrics {
    /// Increment a counter by one
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn record_decoder_iterations(&self, iterations: u32) {
        Self::add(&self.decoder_iterations_total, iterations as u64);
        Self::inc(&self.decoder_iteration_samples);
    }
}
