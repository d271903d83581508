//! PDCCH Candidate Selection
//!
//! Search space hashing per TS 38.213 Section 10.1 and first-fit placement of a
//! DCI on the CORESET CCE bitmap.

use common::{CceBitmap, Rnti};

/// Supported aggregation levels
pub const AGGREGATION_LEVELS: [u8; 5] = [1, 2, 4, 8, 16];

/// Hashing constant A_p for CORESET p with p mod 3 == 0
const HASH_A: u64 = 39_827;
/// Hashing modulus D
const HASH_D: u64 = 65_537;

/// Search space flavour. Common search spaces hash with Y = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSpace {
    Common,
    UeSpecific(Rnti),
}

/// Y_p,n for slot index `slot_index`, starting from Y_p,-1 = RNTI
fn hash_y(rnti: Rnti, slot_index: u32) -> u64 {
    let mut y = rnti.value() as u64;
    for _ in 0..=slot_index {
        y = (HASH_A * y) % HASH_D;
    }
    y
}

/// First CCE of each PDCCH candidate at `aggregation_level`
pub fn candidate_cces(
    search_space: SearchSpace,
    slot_index: u32,
    nof_cces: usize,
    aggregation_level: u8,
    nof_candidates: usize,
) -> Vec<u16> {
    let level = aggregation_level as usize;
    assert!(AGGREGATION_LEVELS.contains(&aggregation_level), "invalid aggregation level {}", aggregation_level);
    if nof_candidates == 0 || level > nof_cces {
        return Vec::new();
    }
    let y = match search_space {
        SearchSpace::Common => 0,
        SearchSpace::UeSpecific(rnti) => hash_y(rnti, slot_index) as usize,
    };
    let nof_slots = nof_cces / level;
    let mut cces = Vec::with_capacity(nof_candidates);
    for m in 0..nof_candidates {
        let cce = level * ((y + (m * nof_cces) / (level * nof_candidates)) % nof_slots);
        if !cces.contains(&(cce as u16)) {
            cces.push(cce as u16);
        }
    }
    cces
}

/// First candidate whose CCEs are all free
pub fn find_free_candidate(cces: &CceBitmap, candidates: &[u16], aggregation_level: u8) -> Option<u16> {
    let level = aggregation_level as usize;
    candidates.iter().copied().find(|&first| {
        let first = first as usize;
        first + level <= cces.size() && !cces.any_in(first, first + level)
    })
}

/// Mark the CCEs of a chosen candidate as used
pub fn allocate_candidate(cces: &mut CceBitmap, first_cce: u16, aggregation_level: u8) {
    let first = first_cce as usize;
    let last = first + aggregation_level as usize;
    assert!(!cces.any_in(first, last), "PDCCH CCEs [{}, {}) already in use", first, last);
    cces.fill(first, last);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_search_space_candidates() {
        // Y = 0: candidates spread evenly over the CORESET.
        let cces = candidate_cces(SearchSpace::Common, 0, 16, 4, 4);
        assert_eq!(cces, vec![0, 4, 8, 12]);
        let cces = candidate_cces(SearchSpace::Common, 0, 16, 8, 2);
        assert_eq!(cces, vec![0, 8]);
    }

    #[test]
    fn test_ue_specific_candidates_aligned_and_in_range() {
        for slot_index in 0..20 {
            for &level in &AGGREGATION_LEVELS[..4] {
                let cces = candidate_cces(SearchSpace::UeSpecific(Rnti(0x4601)), slot_index, 24, level, 2);
                assert!(!cces.is_empty());
                for cce in cces {
                    assert_eq!(cce as usize % level as usize, 0);
                    assert!(cce as usize + level as usize <= 24);
                }
            }
        }
    }

    #[test]
    fn test_hash_depends_on_rnti_and_slot() {
        let a = candidate_cces(SearchSpace::UeSpecific(Rnti(0x4601)), 3, 64, 1, 1);
        let b = candidate_cces(SearchSpace::UeSpecific(Rnti(0x4602)), 3, 64, 1, 1);
        let c = candidate_cces(SearchSpace::UeSpecific(Rnti(0x4601)), 4, 64, 1, 1);
        assert!(a != b || a != c);
    }

    #[test]
    fn test_level_larger_than_coreset() {
        assert!(candidate_cces(SearchSpace::Common, 0, 4, 8, 2).is_empty());
    }

    #[test]
    fn test_first_free_candidate() {
        let mut cces = CceBitmap::new(16);
        let candidates = candidate_cces(SearchSpace::Common, 0, 16, 4, 4);
        let first = find_free_candidate(&cces, &candidates, 4).unwrap();
        assert_eq!(first, 0);
        allocate_candidate(&mut cces, first, 4);
        assert_eq!(find_free_candidate(&cces, &candidates, 4), Some(4));
        cces.fill(4, 16);
        assert_eq!(find_free_candidate(&cces, &candidates, 4), None);
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn test_double_cce_allocation_panics() {
        let mut cces = CceBitmap::new(16);
        allocate_candidate(&mut cces, 0, 2);
        allocate_candidate(&mut cces, 1, 1);
    }
}
