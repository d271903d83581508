//! PRB Grants
//!
//! Frequency-domain allocation of a PDSCH/PUSCH: either an RBG bitmap
//! (resource allocation type 0) or a contiguous PRB interval (type 1).

use crate::prb::{PrbBitmap, PrbInterval, RbgBitmap, MAX_NOF_PRBS, MAX_NOF_RBGS};
use serde::Serialize;
use std::fmt;

/// Nominal RBG size for a BWP, TS 38.214 Table 5.1.2.2.1-1
pub fn nominal_rbg_size(bwp_size: usize, config_1: bool) -> usize {
    match bwp_size {
        0..=36 => if config_1 { 2 } else { 4 },
        37..=72 => if config_1 { 4 } else { 8 },
        73..=144 => if config_1 { 8 } else { 16 },
        _ => 16,
    }
}

/// RBG geometry of a bandwidth part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RbgConfig {
    bwp_start: usize,
    bwp_size: usize,
    rbg_size: usize,
}

impl RbgConfig {
    /// Build the RBG geometry for a BWP starting at CRB `bwp_start` with `bwp_size` PRBs
    pub fn new(bwp_start: usize, bwp_size: usize, config_1: bool) -> Self {
        assert!(bwp_size > 0, "empty BWP");
        assert!(bwp_start + bwp_size <= MAX_NOF_PRBS, "BWP exceeds {} PRBs", MAX_NOF_PRBS);
        let rbg_size = nominal_rbg_size(bwp_size, config_1);
        let cfg = Self { bwp_start, bwp_size, rbg_size };
        debug_assert!(cfg.nof_rbgs() <= MAX_NOF_RBGS);
        cfg
    }

    /// Nominal RBG size P
    pub fn rbg_size(&self) -> usize {
        self.rbg_size
    }

    /// Total CRBs covered by PRB masks built from this geometry
    pub fn nof_crbs(&self) -> usize {
        self.bwp_start + self.bwp_size
    }

    /// Number of RBGs in the BWP
    pub fn nof_rbgs(&self) -> usize {
        let offset = self.bwp_start % self.rbg_size;
        (self.bwp_size + offset).div_ceil(self.rbg_size)
    }

    /// CRB interval covered by RBG `rbg`
    pub fn rbg_prbs(&self, rbg: usize) -> PrbInterval {
        assert!(rbg < self.nof_rbgs(), "RBG index {} out of bounds", rbg);
        let offset = self.bwp_start % self.rbg_size;
        let start = if rbg == 0 {
            self.bwp_start
        } else {
            self.bwp_start + rbg * self.rbg_size - offset
        };
        let stop = (self.bwp_start + (rbg + 1) * self.rbg_size - offset).min(self.nof_crbs());
        PrbInterval::new(start, stop)
    }

    /// Empty RBG bitmap sized for this BWP
    pub fn empty_rbgs(&self) -> RbgBitmap {
        RbgBitmap::new(self.nof_rbgs())
    }

    /// Empty PRB bitmap sized for this BWP
    pub fn empty_prbs(&self) -> PrbBitmap {
        PrbBitmap::new(self.nof_crbs())
    }

    /// PRBs covered by the set RBGs
    pub fn rbg_to_prb_mask(&self, rbgs: &RbgBitmap) -> PrbBitmap {
        let mut prbs = self.empty_prbs();
        for rbg in rbgs.iter_ones() {
            let interval = self.rbg_prbs(rbg);
            prbs.fill(interval.start(), interval.stop());
        }
        prbs
    }

    /// RBGs containing at least one set PRB
    pub fn prb_to_rbg_mask(&self, prbs: &PrbBitmap) -> RbgBitmap {
        let mut rbgs = self.empty_rbgs();
        for rbg in 0..self.nof_rbgs() {
            let interval = self.rbg_prbs(rbg);
            let end = interval.stop().min(prbs.size());
            if interval.start() < end && prbs.any_in(interval.start(), end) {
                rbgs.set(rbg);
            }
        }
        rbgs
    }
}

/// Frequency-domain grant. Only the active variant can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrbGrant {
    /// Resource allocation type 0
    Rbgs(RbgBitmap),
    /// Resource allocation type 1
    Interval(PrbInterval),
}

impl PrbGrant {
    /// Whether this is an allocation type 0 grant
    pub fn is_alloc_type0(&self) -> bool {
        matches!(self, PrbGrant::Rbgs(_))
    }

    /// Whether this is an allocation type 1 grant
    pub fn is_alloc_type1(&self) -> bool {
        matches!(self, PrbGrant::Interval(_))
    }

    /// RBG bitmap, if this is a type 0 grant
    pub fn rbgs(&self) -> Option<&RbgBitmap> {
        match self {
            PrbGrant::Rbgs(rbgs) => Some(rbgs),
            PrbGrant::Interval(_) => None,
        }
    }

    /// PRB interval, if this is a type 1 grant
    pub fn prbs(&self) -> Option<&PrbInterval> {
        match self {
            PrbGrant::Interval(prbs) => Some(prbs),
            PrbGrant::Rbgs(_) => None,
        }
    }

    /// PRB mask occupied by this grant
    pub fn to_prb_mask(&self, rbg_cfg: &RbgConfig) -> PrbBitmap {
        match self {
            PrbGrant::Rbgs(rbgs) => rbg_cfg.rbg_to_prb_mask(rbgs),
            PrbGrant::Interval(prbs) => PrbBitmap::from_interval(rbg_cfg.nof_crbs(), *prbs),
        }
    }

    /// Number of PRBs occupied by this grant
    pub fn nof_prbs(&self, rbg_cfg: &RbgConfig) -> usize {
        match self {
            PrbGrant::Rbgs(rbgs) => rbg_cfg.rbg_to_prb_mask(rbgs).count(),
            PrbGrant::Interval(prbs) => prbs.length(),
        }
    }
}

impl From<RbgBitmap> for PrbGrant {
    fn from(rbgs: RbgBitmap) -> Self {
        PrbGrant::Rbgs(rbgs)
    }
}

impl From<PrbInterval> for PrbGrant {
    fn from(prbs: PrbInterval) -> Self {
        PrbGrant::Interval(prbs)
    }
}

impl fmt::Display for PrbGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrbGrant::Rbgs(rbgs) => write!(f, "rbgs=0b{}", rbgs),
            PrbGrant::Interval(prbs) => write!(f, "prbs={}", prbs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_rbg_size() {
        assert_eq!(nominal_rbg_size(24, true), 2);
        assert_eq!(nominal_rbg_size(52, true), 4);
        assert_eq!(nominal_rbg_size(106, false), 16);
        assert_eq!(nominal_rbg_size(273, true), 16);
    }

    #[test]
    fn test_rbg_geometry_with_offset() {
        // BWP starting at CRB 3 with P=4: first RBG is 1 PRB wide.
        let cfg = RbgConfig::new(3, 50, true);
        assert_eq!(cfg.rbg_size(), 4);
        assert_eq!(cfg.nof_rbgs(), 14);
        assert_eq!(cfg.rbg_prbs(0), PrbInterval::new(3, 4));
        assert_eq!(cfg.rbg_prbs(1), PrbInterval::new(4, 8));
        assert_eq!(cfg.rbg_prbs(13), PrbInterval::new(52, 53));
    }

    #[test]
    fn test_max_bandwidth_rbg_count() {
        let cfg = RbgConfig::new(0, MAX_NOF_PRBS, true);
        assert_eq!(cfg.nof_rbgs(), MAX_NOF_RBGS);
    }

    #[test]
    fn test_rbg_prb_conversions() {
        let cfg = RbgConfig::new(0, 52, true);
        let mut rbgs = cfg.empty_rbgs();
        rbgs.set(1);
        rbgs.set(12);
        let prbs = cfg.rbg_to_prb_mask(&rbgs);
        assert_eq!(prbs.count(), 8);
        assert!(prbs.all_in(4, 8));
        assert!(prbs.all_in(48, 52));

        let mut used = cfg.empty_prbs();
        used.set(5);
        used.set(20);
        let busy = cfg.prb_to_rbg_mask(&used);
        assert_eq!(busy.iter_ones().collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn test_grant_variant_exclusivity() {
        let cfg = RbgConfig::new(0, 52, true);
        let mut grant = PrbGrant::from(PrbInterval::new(0, 10));
        for i in 0..6 {
            if i % 2 == 0 {
                let mut rbgs = cfg.empty_rbgs();
                rbgs.set(i);
                grant = rbgs.into();
                assert!(grant.is_alloc_type0());
                assert!(grant.prbs().is_none());
                assert_eq!(grant.nof_prbs(&cfg), 4);
            } else {
                grant = PrbInterval::new(i, i + 3).into();
                assert!(grant.is_alloc_type1());
                assert!(grant.rbgs().is_none());
                assert_eq!(grant.nof_prbs(&cfg), 3);
            }
        }
    }
}
