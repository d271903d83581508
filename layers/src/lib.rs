//! Slot Scheduling Layers Library
//! 
//! This crate implements the slot-synchronous MAC scheduler of the gNB together with the
//! uplink softbuffer pool it reserves decode buffers from, the per-cell slot dispatcher
//! that drives both, and the counters reported to an external collector.

pub mod phy;
pub mod mac;
pub mod dispatch;
pub mod metrics;

use common::Rnti;
use thiserror::Error;

/// Common errors for the scheduling layers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    
    #[error("Invalid state: {0}")]
    InvalidState(String),
    
    #[error("Unknown UE {0}")]
    UnknownUe(Rnti),
    
    #[error("UE {0} already exists")]
    DuplicateUe(Rnti),
}
