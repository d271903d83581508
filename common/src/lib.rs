//! Common Utilities and Types Library
//! 
//! This crate provides shared types and utilities used across the GNodeB implementation:
//! identifiers, slot timing, and the PRB/RBG arithmetic every allocation decision relies on.

pub mod types;
pub mod slot_point;
pub mod prb;
pub mod grant;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use slot_point::SlotPoint;
pub use prb::{
    find_empty_interval_of_length, find_next_empty_interval, CceBitmap, PrbBitmap, PrbInterval,
    RbgBitmap, ResourceBitmap, MAX_NOF_CCES, MAX_NOF_PRBS, MAX_NOF_RBGS,
};
pub use grant::{PrbGrant, RbgConfig};
pub use utils::*;
