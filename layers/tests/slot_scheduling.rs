use std::sync::Arc;
use std::thread;

use common::{CellId, HarqId, PrbInterval, Rnti, SlotPoint};
use interfaces::message_types::CrcIndication;
use interfaces::{PduCeilings, SlotPduSet, SlotResultSink};
use layers::dispatch::{DispatcherConfig, InlineExecutor, LoggingErrorNotifier, SlotDispatcher};
use layers::mac::{CellScheduler, CellSchedulerConfig, HarqState, PolicyKind, UeConfig};
use layers::phy::{SoftbufferError, SoftbufferId, SoftbufferPool, SoftbufferPoolConfig};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

fn id(rnti: u16) -> SoftbufferId {
    SoftbufferId::new(Rnti(rnti), HarqId(0))
}

fn pool(max_softbuffers: usize, max_nof_codeblocks: usize) -> SoftbufferPool {
    SoftbufferPool::new(SoftbufferPoolConfig {
        max_softbuffers,
        max_nof_codeblocks,
        ..Default::default()
    })
    .unwrap()
}

fn scheduler(cfg: CellSchedulerConfig, softbuffers: SoftbufferPool) -> CellScheduler {
    CellScheduler::new(cfg, softbuffers).unwrap()
}

#[test]
fn softbuffer_capacity_and_reuse() {
    let pool = pool(4, 8);
    let slot = SlotPoint::new(1, 0, 0);
    for rnti in 0x4601..=0x4604 {
        assert!(pool.reserve(slot, id(rnti), 2).is_ok());
    }
    assert_eq!(pool.reserve(slot, id(0x4605), 1).err(), Some(SoftbufferError::NoCapacity));

    pool.free(id(0x4602));
    assert!(pool.reserve(slot, id(0x4605), 2).is_ok());
    assert!(pool.is_reserved(id(0x4605)));
    assert!(!pool.is_reserved(id(0x4602)));
    assert_eq!(pool.stats().nof_reserved, 4);
}

#[test]
fn harq_budget_exhaustion_frees_softbuffer() {
    let softbuffers = pool(8, 64);
    let cfg = CellSchedulerConfig { max_harq_retxs: 2, csi_rs_period_slots: None, ..Default::default() };
    let mut sched = scheduler(cfg, softbuffers.clone());
    let rnti = Rnti(0x4601);
    sched.add_ue(UeConfig::new(rnti)).unwrap();
    sched.handle_bsr(rnti, 400).unwrap();

    let start = SlotPoint::new(1, 10, 0);
    let ul_state = |sched: &CellScheduler| sched.ue_context(rnti).unwrap().ul_harq.get(HarqId(0)).unwrap().state();
    let mut states = vec![ul_state(&sched)];
    let mut nof_nacks = 0;
    for k in 0..60 {
        let result = sched.run_slot(start + k, &[]);
        if k == 0 {
            states.push(ul_state(&sched));
        }
        for pusch in &result.pusch {
            assert_eq!(pusch.harq_id, HarqId(0));
            assert!(softbuffers.is_reserved(SoftbufferId::new(rnti, pusch.harq_id)));
            sched.handle_crc_indication(&CrcIndication {
                rnti,
                harq_id: pusch.harq_id,
                slot: result.slot,
                crc_ok: false,
                decoder_iterations: Some(10),
            });
            nof_nacks += 1;
            states.push(ul_state(&sched));
        }
        if nof_nacks == 3 {
            break;
        }
    }

    assert_eq!(
        states,
        vec![
            HarqState::Empty,
            HarqState::AwaitingFeedback,
            HarqState::AwaitingFeedback,
            HarqState::AwaitingFeedback,
            HarqState::Empty,
        ]
    );
    assert!(!softbuffers.is_reserved(SoftbufferId::new(rnti, HarqId(0))));
    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.ul_retx, 2);
    assert_eq!(metrics.ul_harq_exhausted, 1);
}

#[test]
fn first_fit_in_priority_order() {
    let cfg = CellSchedulerConfig {
        nof_prbs: 10,
        csi_rs_period_slots: None,
        policy: PolicyKind::RoundRobin,
        ..Default::default()
    };
    let mut sched = scheduler(cfg.clone(), pool(8, 64));
    let first = Rnti(0x4601);
    let second = Rnti(0x4602);
    for rnti in [first, second] {
        sched.add_ue(UeConfig::new(rnti)).unwrap();
        sched.handle_dl_buffer_status(rnti, 1, 8 * 60).unwrap();
    }
    // Neither UE was served yet: ties go to the lower RNTI.
    let slot = SlotPoint::new(1, 0, 0);
    let result = sched.run_slot(slot, &[]);
    let grants: Vec<(Rnti, PrbInterval)> =
        result.pdsch.iter().map(|pdsch| (pdsch.rnti, *pdsch.grant.prbs().unwrap())).collect();
    assert_eq!(grants, vec![(first, PrbInterval::new(0, 8)), (second, PrbInterval::new(8, 10))]);

    // A hard minimum above the 2 leftover PRBs defers the second UE.
    let mut sched = scheduler(cfg, pool(8, 64));
    sched.add_ue(UeConfig::new(first)).unwrap();
    sched.add_ue(UeConfig { min_prbs: 3, ..UeConfig::new(second) }).unwrap();
    for rnti in [first, second] {
        sched.handle_dl_buffer_status(rnti, 1, 8 * 60).unwrap();
    }
    let result = sched.run_slot(slot, &[]);
    assert_eq!(result.pdsch.len(), 1);
    assert_eq!(sched.ue_context(second).unwrap().pending_dl_bytes(), 8 * 60);
    assert_eq!(sched.metrics().snapshot().prb_exhaustion, 1);
}

#[test]
fn softbuffer_shortage_skips_and_boosts_ue() {
    let softbuffers = pool(1, 64);
    let cfg = CellSchedulerConfig { csi_rs_period_slots: None, ..Default::default() };
    let mut sched = scheduler(cfg, softbuffers.clone());
    let first = Rnti(0x4601);
    let second = Rnti(0x4602);
    for rnti in [first, second] {
        sched.add_ue(UeConfig { max_prbs: 10, ..UeConfig::new(rnti) }).unwrap();
        sched.handle_bsr(rnti, 100_000).unwrap();
    }

    let slot = SlotPoint::new(1, 0, 0);
    let result = sched.run_slot(slot, &[]);
    assert_eq!(result.pdcch.len(), 1);
    assert_eq!(result.pdcch.as_slice()[0].rnti, first);
    assert!(sched.ue_context(second).unwrap().ul_priority_boost());
    assert_eq!(sched.metrics().snapshot().softbuffer_exhaustion, 1);

    // Nothing frees the only buffer yet: the boosted UE is tried first and skipped again.
    sched.run_slot(slot + 1, &[]);
    assert!(sched.ue_context(second).unwrap().ul_priority_boost());

    for k in 2..4 {
        sched.run_slot(slot + k, &[]);
    }
    let pusch_slot = sched.run_slot(slot + 4, &[]);
    let pusch = &pusch_slot.pusch.as_slice()[0];
    assert_eq!(pusch.rnti, first);
    sched.handle_crc_indication(&CrcIndication {
        rnti: first,
        harq_id: pusch.harq_id,
        slot: pusch_slot.slot,
        crc_ok: true,
        decoder_iterations: None,
    });

    let result = sched.run_slot(slot + 5, &[]);
    assert_eq!(result.pdcch.as_slice()[0].rnti, second);
    assert!(!sched.ue_context(second).unwrap().ul_priority_boost());
}

#[test]
fn ceilings_hold_under_overload() {
    let ceilings = PduCeilings { max_pdcch: 6, max_pdsch: 3, max_pusch: 2, max_pucch: 3, ..Default::default() };
    let cfg = CellSchedulerConfig {
        ceilings,
        nof_cces: 64,
        nof_prbs: 106,
        scs: common::SubcarrierSpacing::Scs15,
        policy: PolicyKind::ProportionalFair,
        ..Default::default()
    };
    let mut sched = scheduler(cfg, pool(64, 512));
    let mut rng = StdRng::seed_from_u64(42);
    for i in 0..32u16 {
        let rnti = Rnti(0x4601 + i);
        sched
            .add_ue(UeConfig { max_prbs: rng.gen_range(1..=20), aggregation_level: 1, ..UeConfig::new(rnti) })
            .unwrap();
    }
    for i in 0..4 {
        sched.handle_paging_request(0x1000 + i);
    }

    let start = SlotPoint::new(0, 1000, 3);
    for k in 0..300 {
        for i in 0..32u16 {
            let rnti = Rnti(0x4601 + i);
            sched.handle_dl_buffer_status(rnti, 1, rng.gen_range(0..5000)).unwrap();
            sched.handle_bsr(rnti, rng.gen_range(0..5000)).unwrap();
        }
        let result: SlotPduSet = sched.run_slot(start + k, &[]);
        assert!(result.pdcch.len() <= 6);
        assert!(result.pdsch.len() <= 3);
        assert!(result.pusch.len() <= 2);
        assert!(result.pucch.len() <= 3);
        assert!(result.paging.len() <= ceilings.max_paging);
        for pusch in &result.pusch {
            sched.handle_crc_indication(&CrcIndication {
                rnti: pusch.rnti,
                harq_id: pusch.harq_id,
                slot: result.slot,
                crc_ok: rng.gen_bool(0.8),
                decoder_iterations: Some(rng.gen_range(1..=8)),
            });
        }
    }
    let metrics = sched.metrics().snapshot();
    assert!(metrics.pdu_ceiling_deferrals > 0);
    assert_eq!(metrics.paging_sent, 4);
    assert_eq!(metrics.slots_processed, 300);
}

#[test]
fn softbuffer_pool_safe_under_concurrent_reservation() {
    let softbuffers = pool(16, 256);
    let slot = SlotPoint::new(1, 0, 0);
    thread::scope(|s| {
        for t in 0..4u16 {
            let softbuffers = softbuffers.clone();
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for i in 0..2000u32 {
                    let key = SoftbufferId::new(Rnti(0x4601 + rng.gen_range(0..8)), HarqId(rng.gen_range(0..4)));
                    match softbuffers.reserve(slot + i, key, rng.gen_range(1..=8)) {
                        Ok(mut handle) => {
                            handle.set_codeblock_crc(0, true);
                            assert!(handle.codeblock_crc(0));
                            if rng.gen_bool(0.5) {
                                softbuffers.free(key);
                            }
                        }
                        Err(SoftbufferError::Locked(locked)) => assert_eq!(locked, key),
                        Err(_) => {}
                    }
                    if i % 64 == 0 {
                        softbuffers.run_slot(slot + i);
                    }
                }
            });
        }
    });
    let stats = softbuffers.stats();
    assert_eq!(stats.nof_locked, 0);
    assert!(stats.nof_reserved <= 16);
}

#[derive(Default)]
struct Recorder {
    results: Mutex<Vec<(CellId, SlotPduSet)>>,
}

impl SlotResultSink for Recorder {
    fn on_new_slot_result(&self, cell: CellId, result: SlotPduSet) {
        self.results.lock().push((cell, result));
    }
}

#[test]
fn dispatcher_drives_scheduler_end_to_end() {
    let recorder = Arc::new(Recorder::default());
    let cfg = CellSchedulerConfig { cell_id: CellId(7), ..Default::default() };
    let dispatcher = SlotDispatcher::new(
        scheduler(cfg, pool(16, 256)),
        DispatcherConfig::default(),
        Arc::new(InlineExecutor),
        recorder.clone(),
        Arc::new(LoggingErrorNotifier),
    )
    .unwrap();

    let rnti = Rnti(0x4601);
    dispatcher.add_ue(UeConfig::new(rnti));
    dispatcher.start().unwrap();
    let start = SlotPoint::new(1, 0, 0);
    for k in 0..40 {
        if k % 10 == 0 {
            dispatcher.handle_dl_buffer_status(rnti, 1, 2000);
            dispatcher.handle_bsr(rnti, 1000);
        }
        assert!(dispatcher.handle_slot_indication(start + k));
    }
    dispatcher.stop();

    let results = recorder.results.lock();
    assert_eq!(results.len(), 40);
    assert!(results.iter().all(|(cell, _)| *cell == CellId(7)));
    assert!(results.iter().any(|(_, r)| !r.pdsch.is_empty()));
    assert!(results.iter().any(|(_, r)| !r.pusch.is_empty()));
    assert!(results.iter().any(|(_, r)| !r.csi_rs.is_empty()));
    let summary = dispatcher.get_ue_scheduling_context(rnti).unwrap();
    assert_eq!(summary.rnti, rnti);
    assert!(summary.avg_dl_rate > 0.0);
}
