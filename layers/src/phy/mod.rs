//! Physical Layer (PHY) Submodules
//! 
//! Only the parts of the upper PHY the scheduler collaborates with live here: the
//! uplink softbuffer pool used by the channel decoder for HARQ soft combining.

pub mod softbuffer;

pub use softbuffer::{
    SoftbufferError, SoftbufferHandle, SoftbufferId, SoftbufferPool, SoftbufferPoolConfig,
    SoftbufferPoolStats,
};
