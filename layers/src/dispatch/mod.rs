//! Slot Dispatcher
//!
//! Drives one cell's scheduler from the slot-boundary timer. A slot indication
//! submits the decision for `slot + processing delay` to an executor; results
//! finishing after their slot began are dropped and reported. Feedback, buffer
//! reports and UE lifecycle events may arrive from any thread; they are queued
//! and applied at the start of the next decision.

pub mod executor;
pub mod notifier;

pub use executor::{InlineExecutor, TokioExecutor};
pub use notifier::LoggingErrorNotifier;

use crate::mac::{CellScheduler, UeConfig, UeContext, UeSchedulingSummary};
use crate::metrics::{CellMetrics, CellMetricsSnapshot};
use crate::phy::SoftbufferPool;
use crate::LayerError;
use common::{CellId, Rnti, SlotPoint};
use interfaces::message_types::{CrcIndication, PrachRequest, UciIndication};
use interfaces::{ChannelType, SlotErrorContext, SlotErrorNotifier, SlotPduSet, SlotResultSink, TaskExecutor};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatcherState {
    Uninitialized,
    Running,
    /// Stop requested, waiting for the in-flight slot task
    WaitStop,
    Stopped,
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Slots between a slot indication and the slot it schedules
    pub processing_delay_slots: u32,
    /// Bound of the PRACH request queue
    pub prach_queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { processing_delay_slots: 2, prach_queue_size: 16 }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.processing_delay_slots == 0 {
            return Err(LayerError::InvalidConfiguration("processing delay must be at least one slot".into()));
        }
        if self.prach_queue_size == 0 {
            return Err(LayerError::InvalidConfiguration("PRACH queue needs room for one request".into()));
        }
        Ok(())
    }
}

enum UeEvent {
    Add(UeConfig),
    Reconfigure(UeConfig),
    Remove(Rnti),
}

enum CellEvent {
    Crc(CrcIndication),
    Uci(UciIndication),
    DlBufferStatus { rnti: Rnti, lcid: u8, bytes: u32 },
    Bsr { rnti: Rnti, bytes: u32 },
    Paging(u64),
}

struct Lifecycle {
    state: DispatcherState,
    in_flight: usize,
}

struct Shared {
    cell: CellId,
    cfg: DispatcherConfig,
    lifecycle: Mutex<Lifecycle>,
    idle: Condvar,
    last_indication: Mutex<Option<SlotPoint>>,
    scheduler: Mutex<CellScheduler>,
    ue_events: Mutex<Vec<UeEvent>>,
    events: Mutex<Vec<CellEvent>>,
    prach_queue: Mutex<VecDeque<PrachRequest>>,
    softbuffers: SoftbufferPool,
    metrics: Arc<CellMetrics>,
    sink: Arc<dyn SlotResultSink>,
    notifier: Arc<dyn SlotErrorNotifier>,
}

/// Decrements the in-flight count when the slot task ends or is dropped unrun
struct InFlightGuard(Arc<Shared>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut lifecycle = self.0.lifecycle.lock();
        lifecycle.in_flight -= 1;
        if lifecycle.in_flight == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl Shared {
    fn error_context(&self, slot: SlotPoint, channel: ChannelType) -> SlotErrorContext {
        SlotErrorContext { cell: self.cell, slot, channel }
    }

    fn drop_late_prach(&self, first_schedulable: SlotPoint) {
        let mut queue = self.prach_queue.lock();
        let mut late = Vec::new();
        queue.retain(|request| {
            let keep = request.slot - first_schedulable >= 0;
            if !keep {
                late.push(request.slot);
            }
            keep
        });
        drop(queue);
        for slot in late {
            CellMetrics::inc(&self.metrics.late_requests);
            self.notifier.on_request_late(self.error_context(slot, ChannelType::Prach));
        }
    }

    fn take_prach(&self, slot: SlotPoint) -> Vec<PrachRequest> {
        let mut queue = self.prach_queue.lock();
        let mut due = Vec::new();
        queue.retain(|request| {
            if request.slot == slot {
                due.push(*request);
                false
            } else {
                true
            }
        });
        due
    }

    fn apply_events(&self, scheduler: &mut CellScheduler) {
        let ue_events = mem::take(&mut *self.ue_events.lock());
        for event in ue_events {
            let outcome = match event {
                UeEvent::Add(cfg) => scheduler.add_ue(cfg),
                UeEvent::Reconfigure(cfg) => scheduler.reconfigure_ue(cfg),
                UeEvent::Remove(rnti) => scheduler.remove_ue(rnti),
            };
            if let Err(e) = outcome {
                warn!("Cell {}: UE event rejected: {}", self.cell, e);
            }
        }

        let events = mem::take(&mut *self.events.lock());
        for event in events {
            let outcome = match event {
                CellEvent::Crc(crc) => {
                    scheduler.handle_crc_indication(&crc);
                    Ok(())
                }
                CellEvent::Uci(uci) => {
                    scheduler.handle_uci_indication(&uci);
                    Ok(())
                }
                CellEvent::DlBufferStatus { rnti, lcid, bytes } => scheduler.handle_dl_buffer_status(rnti, lcid, bytes),
                CellEvent::Bsr { rnti, bytes } => scheduler.handle_bsr(rnti, bytes),
                CellEvent::Paging(identity) => {
                    scheduler.handle_paging_request(identity);
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                debug!("Cell {}: event dropped: {}", self.cell, e);
            }
        }
    }

    fn run_slot(&self, slot: SlotPoint) -> SlotPduSet {
        let prach = self.take_prach(slot);
        let mut scheduler = self.scheduler.lock();
        self.apply_events(&mut scheduler);
        scheduler.run_slot(slot, &prach)
    }

    fn commit(&self, result: SlotPduSet) {
        let current = *self.last_indication.lock();
        let late = current.is_some_and(|current| current - result.slot >= 0);
        if late {
            CellMetrics::inc(&self.metrics.late_slot_results);
            self.notifier.on_late_slot_result(self.cell, result.slot);
            return;
        }
        trace!("Cell {}: slot {} result with {} PDUs", self.cell, result.slot, result.total());
        self.sink.on_new_slot_result(self.cell, result);
    }
}

/// Slot-boundary driver of one cell
#[derive(Clone)]
pub struct SlotDispatcher {
    shared: Arc<Shared>,
    executor: Arc<dyn TaskExecutor>,
}

impl SlotDispatcher {
    pub fn new(
        scheduler: CellScheduler,
        cfg: DispatcherConfig,
        executor: Arc<dyn TaskExecutor>,
        sink: Arc<dyn SlotResultSink>,
        notifier: Arc<dyn SlotErrorNotifier>,
    ) -> Result<Self, LayerError> {
        cfg.validate()?;
        let shared = Shared {
            cell: scheduler.cell_id(),
            cfg,
            lifecycle: Mutex::new(Lifecycle { state: DispatcherState::Uninitialized, in_flight: 0 }),
            idle: Condvar::new(),
            last_indication: Mutex::new(None),
            softbuffers: scheduler.softbuffers().clone(),
            metrics: scheduler.metrics(),
            scheduler: Mutex::new(scheduler),
            ue_events: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            prach_queue: Mutex::new(VecDeque::new()),
            sink,
            notifier,
        };
        Ok(Self { shared: Arc::new(shared), executor })
    }

    pub fn cell_id(&self) -> CellId {
        self.shared.cell
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.lifecycle.lock().state
    }

    pub fn start(&self) -> Result<(), LayerError> {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.state != DispatcherState::Uninitialized {
            return Err(LayerError::InvalidState(format!(
                "cell {} dispatcher cannot start from {:?}", self.shared.cell, lifecycle.state
            )));
        }
        lifecycle.state = DispatcherState::Running;
        info!("Cell {} slot dispatcher running", self.shared.cell);
        Ok(())
    }

    /// Stop accepting slots and block until the in-flight slot task has finished
    pub fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            DispatcherState::Uninitialized | DispatcherState::Stopped => {
                lifecycle.state = DispatcherState::Stopped;
                return;
            }
            DispatcherState::Running => lifecycle.state = DispatcherState::WaitStop,
            DispatcherState::WaitStop => {}
        }
        while lifecycle.in_flight > 0 {
            self.shared.idle.wait(&mut lifecycle);
        }
        lifecycle.state = DispatcherState::Stopped;
        info!("Cell {} slot dispatcher stopped", self.shared.cell);
    }

    /// Slot boundary. Submits the decision for `slot + processing delay`.
    /// Returns whether a slot task was submitted.
    pub fn handle_slot_indication(&self, slot: SlotPoint) -> bool {
        let shared = &self.shared;
        if self.state() != DispatcherState::Running {
            return false;
        }
        {
            let mut last_indication = shared.last_indication.lock();
            if let Some(last) = *last_indication {
                if slot - last <= 0 {
                    drop(last_indication);
                    CellMetrics::inc(&shared.metrics.late_slot_indications);
                    shared.notifier.on_late_slot_indication(shared.cell, slot, last);
                    return false;
                }
            }
            *last_indication = Some(slot);
        }
        let expired = shared.softbuffers.run_slot(slot);
        if expired > 0 {
            debug!("Cell {} slot {}: {} softbuffers expired", shared.cell, slot, expired);
        }

        let slot_tx = slot + shared.cfg.processing_delay_slots;
        shared.drop_late_prach(slot_tx);

        let guard = {
            let mut lifecycle = shared.lifecycle.lock();
            if lifecycle.state != DispatcherState::Running {
                return false;
            }
            if lifecycle.in_flight > 0 {
                CellMetrics::inc(&shared.metrics.slots_skipped);
                warn!("Cell {} slot {}: previous slot still being scheduled, skipping", shared.cell, slot_tx);
                return false;
            }
            lifecycle.in_flight += 1;
            InFlightGuard(shared.clone())
        };

        let task_shared = shared.clone();
        let task = move || {
            let _guard = guard;
            let result = task_shared.run_slot(slot_tx);
            task_shared.commit(result);
        };
        if !self.executor.execute(Box::new(task)) {
            CellMetrics::inc(&shared.metrics.executor_rejections);
            warn!("Cell {} slot {}: executor refused slot task", shared.cell, slot_tx);
            return false;
        }
        true
    }

    /// Queue a PRACH capture. Late or overflowing requests are dropped and reported.
    pub fn handle_prach_request(&self, request: PrachRequest) -> bool {
        let shared = &self.shared;
        let context = shared.error_context(request.slot, ChannelType::Prach);
        if let Some(current) = *shared.last_indication.lock() {
            if request.slot - current <= shared.cfg.processing_delay_slots as i32 {
                CellMetrics::inc(&shared.metrics.late_requests);
                shared.notifier.on_request_late(context);
                return false;
            }
        }
        let mut queue = shared.prach_queue.lock();
        if queue.len() >= shared.cfg.prach_queue_size {
            drop(queue);
            CellMetrics::inc(&shared.metrics.request_overflows);
            shared.notifier.on_request_overflow(context);
            return false;
        }
        queue.push_back(request);
        true
    }

    pub fn handle_crc_indication(&self, crc: CrcIndication) {
        self.shared.events.lock().push(CellEvent::Crc(crc));
    }

    pub fn handle_uci_indication(&self, uci: UciIndication) {
        self.shared.events.lock().push(CellEvent::Uci(uci));
    }

    pub fn handle_dl_buffer_status(&self, rnti: Rnti, lcid: u8, bytes: u32) {
        self.shared.events.lock().push(CellEvent::DlBufferStatus { rnti, lcid, bytes });
    }

    pub fn handle_bsr(&self, rnti: Rnti, bytes: u32) {
        self.shared.events.lock().push(CellEvent::Bsr { rnti, bytes });
    }

    pub fn handle_paging_request(&self, paging_identity: u64) {
        self.shared.events.lock().push(CellEvent::Paging(paging_identity));
    }

    pub fn add_ue(&self, cfg: UeConfig) {
        self.shared.ue_events.lock().push(UeEvent::Add(cfg));
    }

    pub fn reconfigure_ue(&self, cfg: UeConfig) {
        self.shared.ue_events.lock().push(UeEvent::Reconfigure(cfg));
    }

    pub fn remove_ue(&self, rnti: Rnti) {
        self.shared.ue_events.lock().push(UeEvent::Remove(rnti));
    }

    /// Read access to the scheduling context of a UE
    pub fn with_ue_context<R>(&self, rnti: Rnti, f: impl FnOnce(&UeContext) -> R) -> Option<R> {
        let scheduler = self.shared.scheduler.lock();
        scheduler.ue_context(rnti).map(f)
    }

    pub fn get_ue_scheduling_context(&self, rnti: Rnti) -> Option<UeSchedulingSummary> {
        self.shared.scheduler.lock().ue_summary(rnti)
    }

    pub fn nof_ues(&self) -> usize {
        self.shared.scheduler.lock().nof_ues()
    }

    pub fn metrics(&self) -> CellMetricsSnapshot {
        CellMetricsSnapshot { cell: Some(self.shared.cell), ..self.shared.metrics.snapshot() }
    }

    pub fn softbuffers(&self) -> &SoftbufferPool {
        &self.shared.softbuffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::CellSchedulerConfig;
    use crate::phy::{SoftbufferId, SoftbufferPoolConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Task = Box<dyn FnOnce() + Send + 'static>;

    #[derive(Default)]
    struct CollectingSink {
        results: Mutex<Vec<SlotPduSet>>,
        delay: Option<Duration>,
    }

    impl SlotResultSink for CollectingSink {
        fn on_new_slot_result(&self, _cell: CellId, result: SlotPduSet) {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.results.lock().push(result);
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        late_results: AtomicUsize,
        late_indications: AtomicUsize,
        late_requests: AtomicUsize,
        overflows: AtomicUsize,
    }

    impl SlotErrorNotifier for CountingNotifier {
        fn on_late_slot_result(&self, _cell: CellId, _slot: SlotPoint) {
            self.late_results.fetch_add(1, Ordering::SeqCst);
        }

        fn on_late_slot_indication(&self, _cell: CellId, _slot: SlotPoint, _last: SlotPoint) {
            self.late_indications.fetch_add(1, Ordering::SeqCst);
        }

        fn on_request_late(&self, _context: SlotErrorContext) {
            self.late_requests.fetch_add(1, Ordering::SeqCst);
        }

        fn on_request_overflow(&self, _context: SlotErrorContext) {
            self.overflows.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Holds tasks until told to run them
    #[derive(Default)]
    struct ManualExecutor {
        tasks: Mutex<Vec<Task>>,
    }

    impl ManualExecutor {
        fn run_all(&self) {
            let tasks = mem::take(&mut *self.tasks.lock());
            for task in tasks {
                task();
            }
        }
    }

    impl TaskExecutor for ManualExecutor {
        fn execute(&self, task: Task) -> bool {
            self.tasks.lock().push(task);
            true
        }
    }

    struct RejectingExecutor;

    impl TaskExecutor for RejectingExecutor {
        fn execute(&self, _task: Task) -> bool {
            false
        }
    }

    fn cell_scheduler() -> CellScheduler {
        let cfg = CellSchedulerConfig { csi_rs_period_slots: None, ..Default::default() };
        let pool = SoftbufferPool::new(SoftbufferPoolConfig::default()).unwrap();
        CellScheduler::new(cfg, pool).unwrap()
    }

    fn dispatcher(
        executor: Arc<dyn TaskExecutor>,
        sink: Arc<CollectingSink>,
        notifier: Arc<CountingNotifier>,
    ) -> SlotDispatcher {
        SlotDispatcher::new(cell_scheduler(), DispatcherConfig::default(), executor, sink, notifier).unwrap()
    }

    fn slot(count: u32) -> SlotPoint {
        SlotPoint::from_count(1, count)
    }

    #[test]
    fn test_lifecycle() {
        let d = dispatcher(Arc::new(InlineExecutor), Arc::default(), Arc::default());
        assert_eq!(d.state(), DispatcherState::Uninitialized);
        assert!(!d.handle_slot_indication(slot(0)));
        d.start().unwrap();
        assert!(d.start().is_err());
        assert_eq!(d.state(), DispatcherState::Running);
        d.stop();
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(!d.handle_slot_indication(slot(1)));
        d.stop();

        let never_started = dispatcher(Arc::new(InlineExecutor), Arc::default(), Arc::default());
        never_started.stop();
        assert_eq!(never_started.state(), DispatcherState::Stopped);
        assert!(never_started.start().is_err());
    }

    #[test]
    fn test_results_target_processing_delay() {
        let sink = Arc::new(CollectingSink::default());
        let d = dispatcher(Arc::new(InlineExecutor), sink.clone(), Arc::default());
        let rnti = Rnti(0x4601);
        d.add_ue(UeConfig::new(rnti));
        d.handle_dl_buffer_status(rnti, 1, 500);
        d.start().unwrap();

        for count in 10..15 {
            assert!(d.handle_slot_indication(slot(count)));
        }
        let results = sink.results.lock();
        let slots: Vec<u32> = results.iter().map(|r| r.slot.count()).collect();
        assert_eq!(slots, vec![12, 13, 14, 15, 16]);
        assert_eq!(results[0].pdsch.len(), 1);
        assert_eq!(d.nof_ues(), 1);
        assert_eq!(d.with_ue_context(rnti, |ue| ue.pending_dl_bytes()), Some(0));
    }

    #[test]
    fn test_busy_cell_skips_and_late_result_dropped() {
        let executor = Arc::new(ManualExecutor::default());
        let sink = Arc::new(CollectingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let d = dispatcher(executor.clone(), sink.clone(), notifier.clone());
        d.start().unwrap();

        assert!(d.handle_slot_indication(slot(0)));
        // Slot 2 is still being decided when slots 1 and 2 start.
        assert!(!d.handle_slot_indication(slot(1)));
        assert!(!d.handle_slot_indication(slot(2)));
        executor.run_all();

        assert!(sink.results.lock().is_empty());
        assert_eq!(notifier.late_results.load(Ordering::SeqCst), 1);
        let metrics = d.metrics();
        assert_eq!(metrics.slots_skipped, 2);
        assert_eq!(metrics.late_slot_results, 1);
        assert_eq!(metrics.cell, Some(CellId(1)));

        assert!(d.handle_slot_indication(slot(3)));
        executor.run_all();
        assert_eq!(sink.results.lock().len(), 1);
    }

    #[test]
    fn test_repeated_or_backward_slot_indication_dropped() {
        let sink = Arc::new(CollectingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let d = dispatcher(Arc::new(InlineExecutor), sink.clone(), notifier.clone());
        d.start().unwrap();

        assert!(d.handle_slot_indication(slot(7)));
        assert!(!d.handle_slot_indication(slot(7)));
        assert!(!d.handle_slot_indication(slot(4)));
        assert_eq!(notifier.late_indications.load(Ordering::SeqCst), 2);
        let metrics = d.metrics();
        assert_eq!(metrics.late_slot_indications, 2);
        assert_eq!(metrics.slots_processed, 1);

        assert!(d.handle_slot_indication(slot(8)));
        let slots: Vec<u32> = sink.results.lock().iter().map(|r| r.slot.count()).collect();
        assert_eq!(slots, vec![9, 10]);
    }

    #[test]
    fn test_rejected_task_releases_slot() {
        let d = dispatcher(Arc::new(RejectingExecutor), Arc::default(), Arc::default());
        d.start().unwrap();
        assert!(!d.handle_slot_indication(slot(0)));
        assert!(!d.handle_slot_indication(slot(1)));
        let metrics = d.metrics();
        assert_eq!(metrics.executor_rejections, 2);
        assert_eq!(metrics.slots_skipped, 0);
        d.stop();
        assert_eq!(d.state(), DispatcherState::Stopped);
    }

    #[test]
    fn test_prach_late_and_overflow() {
        let sink = Arc::new(CollectingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let scheduler = cell_scheduler();
        let cfg = DispatcherConfig { processing_delay_slots: 2, prach_queue_size: 2 };
        let d = SlotDispatcher::new(scheduler, cfg, Arc::new(InlineExecutor), sink.clone(), notifier.clone()).unwrap();
        d.start().unwrap();
        d.handle_slot_indication(slot(0));

        let request = |count| PrachRequest { slot: slot(count), start_symbol: 0, nof_fd_occasions: 1 };
        // Slot 2 is already decided.
        assert!(!d.handle_prach_request(request(2)));
        assert!(d.handle_prach_request(request(3)));
        assert!(d.handle_prach_request(request(4)));
        assert!(!d.handle_prach_request(request(5)));
        assert_eq!(notifier.late_requests.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.overflows.load(Ordering::SeqCst), 1);

        d.handle_slot_indication(slot(1));
        d.handle_slot_indication(slot(2));
        let results = sink.results.lock();
        let prach: Vec<(u32, usize)> = results.iter().map(|r| (r.slot.count(), r.prach.len())).collect();
        assert_eq!(prach, vec![(2, 0), (3, 1), (4, 1)]);
    }

    #[test]
    fn test_feedback_applied_at_next_slot() {
        let sink = Arc::new(CollectingSink::default());
        let d = dispatcher(Arc::new(InlineExecutor), sink.clone(), Arc::default());
        let rnti = Rnti(0x4601);
        d.add_ue(UeConfig::new(rnti));
        d.handle_bsr(rnti, 400);
        d.start().unwrap();

        // PUSCH lands k2 = 4 slots after its DCI in slot 2.
        for count in 0..5 {
            d.handle_slot_indication(slot(count));
        }
        let pusch = {
            let results = sink.results.lock();
            let pusch_result = results.iter().find(|r| !r.pusch.is_empty()).unwrap();
            assert_eq!(pusch_result.slot, slot(6));
            (pusch_result.slot, pusch_result.pusch.as_slice()[0].harq_id)
        };
        let id = SoftbufferId::new(rnti, pusch.1);
        assert!(d.softbuffers().is_reserved(id));

        d.handle_crc_indication(CrcIndication { rnti, harq_id: pusch.1, slot: pusch.0, crc_ok: true, decoder_iterations: None });
        assert!(d.softbuffers().is_reserved(id));
        d.handle_slot_indication(slot(5));
        assert!(!d.softbuffers().is_reserved(id));
        assert_eq!(d.metrics().ul_crc_ok, 1);

        d.remove_ue(rnti);
        d.handle_slot_indication(slot(6));
        assert_eq!(d.nof_ues(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_task() {
        let sink = Arc::new(CollectingSink { delay: Some(Duration::from_millis(50)), ..Default::default() });
        let executor = Arc::new(TokioExecutor::current().unwrap());
        let d = dispatcher(executor, sink.clone(), Arc::default());
        d.start().unwrap();
        assert!(d.handle_slot_indication(slot(0)));

        let stopper = d.clone();
        tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
        assert_eq!(d.state(), DispatcherState::Stopped);
        assert_eq!(sink.results.lock().len(), 1);
        assert!(!d.handle_slot_indication(slot(1)));
    }
}
