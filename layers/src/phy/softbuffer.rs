//! Uplink Softbuffer Pool
//!
//! Fixed-capacity pool of receive soft-combining buffers keyed by (RNTI, HARQ process).
//! The scheduler reserves a buffer for every PUSCH it grants; the decoder locks it through
//! a [`SoftbufferHandle`] while processing. Buffers not touched for
//! `expire_timeout_slots` are released by [`SoftbufferPool::run_slot`] unless locked.
//!
//! The pool lock only guards the reservation table. Buffer contents sit behind a
//! per-buffer lock and are (re)initialised after the table lock is dropped, while the
//! new reservation is already locked by the handle being returned.

use crate::LayerError;
use common::{HarqId, Rnti, SlotPoint};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Upper bound for soft bits per codeblock (LDPC BG1 circular buffer, 66 x 384)
pub const MAX_CODEBLOCK_SOFT_BITS: usize = 25_344;

/// Softbuffer key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SoftbufferId {
    pub rnti: Rnti,
    pub harq_id: HarqId,
}

impl SoftbufferId {
    pub fn new(rnti: Rnti, harq_id: HarqId) -> Self {
        Self { rnti, harq_id }
    }
}

impl fmt::Display for SoftbufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rnti={} h_id={}", self.rnti, self.harq_id)
    }
}

/// Softbuffer pool configuration
#[derive(Debug, Clone)]
pub struct SoftbufferPoolConfig {
    /// Number of softbuffers in the pool
    pub max_softbuffers: usize,
    /// Codeblocks shared by all softbuffers
    pub max_nof_codeblocks: usize,
    /// Soft bits stored per codeblock
    pub max_codeblock_size: usize,
    /// Slots a reservation survives without being reserved again
    pub expire_timeout_slots: u32,
}

impl Default for SoftbufferPoolConfig {
    fn default() -> Self {
        Self {
            max_softbuffers: 64,
            max_nof_codeblocks: 512,
            max_codeblock_size: MAX_CODEBLOCK_SOFT_BITS,
            expire_timeout_slots: 100,
        }
    }
}

impl SoftbufferPoolConfig {
    /// Reject configurations the pool cannot honour
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.max_softbuffers == 0 {
            return Err(LayerError::InvalidConfiguration("softbuffer pool needs at least one buffer".into()));
        }
        if self.max_nof_codeblocks == 0 {
            return Err(LayerError::InvalidConfiguration("softbuffer pool needs at least one codeblock".into()));
        }
        if self.max_codeblock_size == 0 || self.max_codeblock_size > MAX_CODEBLOCK_SOFT_BITS {
            return Err(LayerError::InvalidConfiguration(format!(
                "codeblock size {} outside (0, {}]",
                self.max_codeblock_size, MAX_CODEBLOCK_SOFT_BITS
            )));
        }
        if self.expire_timeout_slots == 0 {
            return Err(LayerError::InvalidConfiguration("softbuffer expiry must be at least one slot".into()));
        }
        Ok(())
    }
}

/// Reservation failures. None of them is fatal; the HARQ process is skipped this slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SoftbufferError {
    #[error("no softbuffer available")]
    NoCapacity,

    #[error("insufficient codeblocks: requested {requested}, available {available}")]
    InsufficientCodeblocks { requested: usize, available: usize },

    #[error("softbuffer {0} is locked")]
    Locked(SoftbufferId),

    #[error("invalid number of codeblocks {0}")]
    InvalidCodeblockCount(usize),
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SoftbufferPoolStats {
    pub capacity: usize,
    pub nof_reserved: usize,
    pub nof_locked: usize,
    pub free_codeblocks: usize,
}

#[derive(Debug)]
struct Reservation {
    id: SoftbufferId,
    expire_slot: SlotPoint,
    nof_codeblocks: usize,
    lock_count: u32,
    release_pending: bool,
}

#[derive(Debug)]
struct PoolState {
    entries: Vec<Option<Reservation>>,
    free_codeblocks: usize,
}

impl PoolState {
    fn find(&self, id: &SoftbufferId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|r| r.id == *id))
    }

    fn release(&mut self, index: usize) {
        if let Some(reservation) = self.entries[index].take() {
            assert_eq!(reservation.lock_count, 0, "releasing locked softbuffer {}", reservation.id);
            self.free_codeblocks += reservation.nof_codeblocks;
            trace!("Released softbuffer {} ({} codeblocks)", reservation.id, reservation.nof_codeblocks);
        }
    }
}

/// Decode state of one softbuffer
#[derive(Debug, Default)]
struct SoftbufferData {
    crcs: Vec<bool>,
    soft_bits: Vec<Vec<i8>>,
}

impl SoftbufferData {
    fn reset(&mut self, nof_codeblocks: usize, codeblock_size: usize) {
        self.crcs.clear();
        self.crcs.resize(nof_codeblocks, false);
        self.soft_bits.resize_with(nof_codeblocks, Vec::new);
        for codeblock in self.soft_bits.iter_mut() {
            codeblock.clear();
            codeblock.resize(codeblock_size, 0);
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    config: SoftbufferPoolConfig,
    state: Mutex<PoolState>,
    buffers: Vec<Mutex<SoftbufferData>>,
}

/// Thread-safe softbuffer pool. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct SoftbufferPool {
    inner: Arc<PoolInner>,
}

impl SoftbufferPool {
    /// Create a pool. Buffer storage is allocated on first reservation.
    pub fn new(config: SoftbufferPoolConfig) -> Result<Self, LayerError> {
        config.validate()?;
        info!(
            "Creating softbuffer pool: {} buffers, {} codeblocks of {} soft bits, expiry {} slots",
            config.max_softbuffers, config.max_nof_codeblocks, config.max_codeblock_size, config.expire_timeout_slots
        );

        let entries = (0..config.max_softbuffers).map(|_| None).collect();
        let buffers = (0..config.max_softbuffers).map(|_| Mutex::new(SoftbufferData::default())).collect();
        let state = PoolState { entries, free_codeblocks: config.max_nof_codeblocks };

        Ok(Self {
            inner: Arc::new(PoolInner { config, state: Mutex::new(state), buffers }),
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &SoftbufferPoolConfig {
        &self.inner.config
    }

    /// Reserve (or re-reserve) the softbuffer for `id` and lock it.
    ///
    /// Same codeblock count as the live reservation keeps the contents for soft
    /// combining; a different count reinitialises them.
    pub fn reserve(
        &self,
        slot: SlotPoint,
        id: SoftbufferId,
        nof_codeblocks: usize,
    ) -> Result<SoftbufferHandle, SoftbufferError> {
        if nof_codeblocks == 0 || nof_codeblocks > self.inner.config.max_nof_codeblocks {
            return Err(SoftbufferError::InvalidCodeblockCount(nof_codeblocks));
        }
        let expire_slot = slot + self.inner.config.expire_timeout_slots;

        let (index, needs_reset) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.find(&id) {
                Some(index) => {
                    let Some(entry) = state.entries[index].as_mut() else {
                        unreachable!("softbuffer entry vanished under the pool lock");
                    };
                    if entry.lock_count > 0 {
                        return Err(SoftbufferError::Locked(id));
                    }
                    let needs_reset = entry.nof_codeblocks != nof_codeblocks;
                    if needs_reset {
                        let available = state.free_codeblocks + entry.nof_codeblocks;
                        if nof_codeblocks > available {
                            return Err(SoftbufferError::InsufficientCodeblocks { requested: nof_codeblocks, available });
                        }
                        state.free_codeblocks = available - nof_codeblocks;
                        entry.nof_codeblocks = nof_codeblocks;
                    }
                    entry.expire_slot = expire_slot;
                    entry.lock_count = 1;
                    (index, needs_reset)
                }
                None => {
                    let Some(index) = state.entries.iter().position(Option::is_none) else {
                        return Err(SoftbufferError::NoCapacity);
                    };
                    if nof_codeblocks > state.free_codeblocks {
                        return Err(SoftbufferError::InsufficientCodeblocks {
                            requested: nof_codeblocks,
                            available: state.free_codeblocks,
                        });
                    }
                    state.free_codeblocks -= nof_codeblocks;
                    state.entries[index] = Some(Reservation {
                        id,
                        expire_slot,
                        nof_codeblocks,
                        lock_count: 1,
                        release_pending: false,
                    });
                    (index, true)
                }
            }
        };

        if needs_reset {
            self.inner.buffers[index].lock().reset(nof_codeblocks, self.inner.config.max_codeblock_size);
        }
        trace!("Reserved softbuffer {} in slot {} ({} codeblocks)", id, slot, nof_codeblocks);

        Ok(SoftbufferHandle { pool: self.inner.clone(), index, id, nof_codeblocks })
    }

    /// Release the reservation for `id`. Unknown or already free ids are ignored.
    ///
    /// A locked buffer is released as soon as its handle is dropped.
    pub fn free(&self, id: SoftbufferId) {
        let mut state = self.inner.state.lock();
        let Some(index) = state.find(&id) else {
            return;
        };
        let locked = state.entries[index].as_ref().is_some_and(|r| r.lock_count > 0);
        if locked {
            if let Some(entry) = state.entries[index].as_mut() {
                entry.release_pending = true;
            }
        } else {
            state.release(index);
        }
    }

    /// Release every unlocked reservation whose expiry slot has been reached.
    /// Returns the number of released buffers.
    pub fn run_slot(&self, slot: SlotPoint) -> usize {
        let mut state = self.inner.state.lock();
        let expired: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                Some(r) if r.lock_count == 0 && slot.distance(&r.expire_slot) >= 0 => Some(i),
                _ => None,
            })
            .collect();
        for index in &expired {
            state.release(*index);
        }
        if !expired.is_empty() {
            debug!("Softbuffer pool expired {} buffers in slot {}", expired.len(), slot);
        }
        expired.len()
    }

    /// Whether `id` currently holds a reservation
    pub fn is_reserved(&self, id: SoftbufferId) -> bool {
        self.inner.state.lock().find(&id).is_some()
    }

    /// Current occupancy
    pub fn stats(&self) -> SoftbufferPoolStats {
        let state = self.inner.state.lock();
        let reserved = state.entries.iter().flatten();
        SoftbufferPoolStats {
            capacity: state.entries.len(),
            nof_reserved: reserved.clone().count(),
            nof_locked: reserved.filter(|r| r.lock_count > 0).count(),
            free_codeblocks: state.free_codeblocks,
        }
    }
}

/// Exclusive, locked access to a reserved softbuffer.
///
/// Move-only: at most one handle exists per buffer. Dropping it unlocks the buffer
/// and completes a release requested while it was locked.
#[derive(Debug)]
pub struct SoftbufferHandle {
    pool: Arc<PoolInner>,
    index: usize,
    id: SoftbufferId,
    nof_codeblocks: usize,
}

impl SoftbufferHandle {
    pub fn id(&self) -> SoftbufferId {
        self.id
    }

    pub fn nof_codeblocks(&self) -> usize {
        self.nof_codeblocks
    }

    fn data(&self) -> MutexGuard<'_, SoftbufferData> {
        self.pool.buffers[self.index].lock()
    }

    /// CRC result of a codeblock from a previous decode attempt
    pub fn codeblock_crc(&self, codeblock: usize) -> bool {
        assert!(codeblock < self.nof_codeblocks, "codeblock {} out of range", codeblock);
        self.data().crcs[codeblock]
    }

    /// Record the CRC result of a codeblock
    pub fn set_codeblock_crc(&mut self, codeblock: usize, crc_ok: bool) {
        assert!(codeblock < self.nof_codeblocks, "codeblock {} out of range", codeblock);
        self.data().crcs[codeblock] = crc_ok;
    }

    /// Forget all codeblock CRC results
    pub fn reset_codeblock_crcs(&mut self) {
        self.data().crcs.iter_mut().for_each(|c| *c = false);
    }

    /// Soft bits of a codeblock
    pub fn codeblock_soft_bits(&mut self, codeblock: usize) -> MappedMutexGuard<'_, [i8]> {
        assert!(codeblock < self.nof_codeblocks, "codeblock {} out of range", codeblock);
        MutexGuard::map(self.data(), |d| d.soft_bits[codeblock].as_mut_slice())
    }

    /// Unlock and release the reservation
    pub fn release(self) {
        {
            let mut state = self.pool.state.lock();
            if let Some(entry) = state.entries[self.index].as_mut() {
                entry.release_pending = true;
            }
        }
        drop(self);
    }
}

impl Drop for SoftbufferHandle {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        let release = match state.entries[self.index].as_mut() {
            Some(entry) if entry.id == self.id => {
                assert!(entry.lock_count > 0, "softbuffer {} unlocked more than locked", self.id);
                entry.lock_count -= 1;
                entry.lock_count == 0 && entry.release_pending
            }
            _ => panic!("softbuffer {} released while a handle was alive", self.id),
        };
        if release {
            state.release(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;

    fn pool(max_softbuffers: usize, max_nof_codeblocks: usize, expire: u32) -> SoftbufferPool {
        SoftbufferPool::new(SoftbufferPoolConfig {
            max_softbuffers,
            max_nof_codeblocks,
            max_codeblock_size: 64,
            expire_timeout_slots: expire,
        })
        .unwrap()
    }

    fn id(rnti: u16, harq: u8) -> SoftbufferId {
        SoftbufferId::new(Rnti(rnti), HarqId(harq))
    }

    fn slot(count: u32) -> SlotPoint {
        SlotPoint::from_count(1, count)
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = SoftbufferPoolConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.max_codeblock_size = MAX_CODEBLOCK_SOFT_BITS + 1;
        assert!(cfg.validate().is_err());
        cfg.max_codeblock_size = 0;
        assert!(SoftbufferPool::new(cfg).is_err());
    }

    #[test]
    fn test_capacity_and_reuse() {
        let pool = pool(4, 32, 10);
        for rnti in 1..=4 {
            assert!(pool.reserve(slot(0), id(rnti, 0), 8).is_ok());
        }
        assert_eq!(pool.reserve(slot(0), id(5, 0), 8).unwrap_err(), SoftbufferError::NoCapacity);
        pool.free(id(2, 0));
        assert!(pool.reserve(slot(0), id(5, 0), 8).is_ok());
        assert!(!pool.is_reserved(id(2, 0)));
        assert_eq!(pool.stats().nof_reserved, 4);
    }

    #[test]
    fn test_codeblock_budget() {
        let pool = pool(4, 10, 10);
        assert!(pool.reserve(slot(0), id(1, 0), 6).is_ok());
        assert_eq!(
            pool.reserve(slot(0), id(2, 0), 6).unwrap_err(),
            SoftbufferError::InsufficientCodeblocks { requested: 6, available: 4 }
        );
        // Growing an existing reservation may reuse its own codeblocks.
        assert!(pool.reserve(slot(0), id(1, 0), 10).is_ok());
        assert_eq!(pool.stats().free_codeblocks, 0);
        assert_eq!(
            pool.reserve(slot(0), id(1, 0), 0).unwrap_err(),
            SoftbufferError::InvalidCodeblockCount(0)
        );
    }

    #[test]
    fn test_reservation_preserves_or_resets_contents() {
        let pool = pool(2, 16, 10);
        {
            let mut handle = pool.reserve(slot(0), id(1, 3), 4).unwrap();
            handle.codeblock_soft_bits(2)[7] = 42;
            handle.set_codeblock_crc(1, true);
        }
        {
            let mut handle = pool.reserve(slot(1), id(1, 3), 4).unwrap();
            assert_eq!(handle.codeblock_soft_bits(2)[7], 42);
            assert!(handle.codeblock_crc(1));
        }
        {
            let mut handle = pool.reserve(slot(2), id(1, 3), 5).unwrap();
            assert_eq!(handle.nof_codeblocks(), 5);
            assert_eq!(handle.codeblock_soft_bits(2)[7], 0);
            assert!(!handle.codeblock_crc(1));
        }
    }

    #[test]
    fn test_locked_buffer_cannot_be_reserved_twice() {
        let pool = pool(2, 16, 10);
        let handle = pool.reserve(slot(0), id(1, 0), 2).unwrap();
        assert_eq!(pool.reserve(slot(0), id(1, 0), 2).unwrap_err(), SoftbufferError::Locked(id(1, 0)));
        drop(handle);
        assert!(pool.reserve(slot(0), id(1, 0), 2).is_ok());
    }

    #[test]
    fn test_free_while_locked_is_deferred() {
        let pool = pool(1, 16, 10);
        let handle = pool.reserve(slot(0), id(1, 0), 2).unwrap();
        pool.free(id(1, 0));
        assert!(pool.is_reserved(id(1, 0)));
        assert_eq!(pool.reserve(slot(0), id(2, 0), 2).unwrap_err(), SoftbufferError::NoCapacity);
        drop(handle);
        assert!(!pool.is_reserved(id(1, 0)));
        assert!(pool.reserve(slot(0), id(2, 0), 2).is_ok());
    }

    #[test]
    fn test_free_is_idempotent() {
        let pool = pool(2, 16, 10);
        pool.free(id(9, 9));
        drop(pool.reserve(slot(0), id(1, 0), 2).unwrap());
        pool.free(id(1, 0));
        pool.free(id(1, 0));
        assert_eq!(pool.stats().free_codeblocks, 16);
    }

    #[test]
    fn test_handle_release() {
        let pool = pool(1, 4, 10);
        let handle = pool.reserve(slot(0), id(1, 0), 2).unwrap();
        handle.release();
        assert!(!pool.is_reserved(id(1, 0)));
        assert_eq!(pool.stats().free_codeblocks, 4);
    }

    #[test]
    fn test_expiry() {
        let pool = pool(2, 16, 5);
        drop(pool.reserve(slot(10), id(1, 0), 2).unwrap());
        assert_eq!(pool.run_slot(slot(14)), 0);
        assert!(pool.is_reserved(id(1, 0)));
        // Reserving again pushes the expiry forward.
        drop(pool.reserve(slot(12), id(1, 0), 2).unwrap());
        assert_eq!(pool.run_slot(slot(16)), 0);
        assert_eq!(pool.run_slot(slot(17)), 1);
        assert!(!pool.is_reserved(id(1, 0)));
    }

    #[test]
    fn test_expiry_respects_locks() {
        let pool = pool(2, 16, 5);
        let handle = pool.reserve(slot(0), id(1, 0), 2).unwrap();
        for count in [5, 100, 1000, 5000] {
            assert_eq!(pool.run_slot(slot(count)), 0);
            assert!(pool.is_reserved(id(1, 0)));
        }
        drop(handle);
        assert_eq!(pool.run_slot(slot(6)), 1);
    }

    #[test]
    fn test_concurrent_reserve_and_free() {
        let pool = pool(8, 64, 4);
        let threads = 8;
        let barrier = Barrier::new(threads + 1);

        std::thread::scope(|s| {
            for t in 0..threads {
                let pool = pool.clone();
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..500u32 {
                        let sb_id = id(1 + (t as u16 % 4), (i % 3) as u8);
                        match pool.reserve(slot(i), sb_id, 1 + (i as usize % 4)) {
                            Ok(mut handle) => {
                                handle.set_codeblock_crc(0, true);
                                if i % 5 == 0 {
                                    handle.release();
                                }
                            }
                            Err(SoftbufferError::Locked(_))
                            | Err(SoftbufferError::NoCapacity)
                            | Err(SoftbufferError::InsufficientCodeblocks { .. }) => {}
                            Err(e) => panic!("unexpected error {e}"),
                        }
                        if i % 7 == 0 {
                            pool.free(sb_id);
                        }
                    }
                });
            }
            let pool = pool.clone();
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..500 {
                    pool.run_slot(slot(i));
                }
            });
        });

        let state = pool.inner.state.lock();
        let mut seen = HashSet::new();
        let mut used_codeblocks = 0;
        for reservation in state.entries.iter().flatten() {
            assert!(seen.insert(reservation.id), "duplicate reservation for {}", reservation.id);
            assert_eq!(reservation.lock_count, 0);
            used_codeblocks += reservation.nof_codeblocks;
        }
        assert_eq!(used_codeblocks + state.free_codeblocks, 64);
    }
}
