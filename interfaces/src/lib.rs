//! MAC-PHY Collaboration Interfaces Library
//! 
//! This crate defines the messages and traits through which the slot scheduling core talks
//! to the layers around it: the per-slot PDU set handed to the PHY, the decode and feedback
//! indications flowing back, timing-violation notifications and the task executor seam.

pub mod message_types;
pub mod slot_result;
pub mod phy_gateway;

pub use message_types::*;
pub use slot_result::{ChannelType, PduCeilings, PduList, SlotPduSet};
pub use phy_gateway::{SlotErrorContext, SlotErrorNotifier, SlotResultSink, TaskExecutor};
