//! Shared data structures for the acquisition pipeline and export gateway
//!
//! - Ingest: `DeviceDataMessage`, `TimestampedValue` (protocol driver output)
//! - Alarms: `AlarmRule`, `AlarmOccurrence`, `AlarmEvent`, wire `AlarmEventData`
//! - Enrichment: `VirtualPoint` definitions
//! - Export: `DynamicTarget`, legacy `CspAlarmMessage`, `TargetSendResult`

mod alarm;
mod export;
mod message;
mod value;
mod virtual_point;

pub use alarm::*;
pub use export::*;
pub use message::*;
pub use value::*;
pub use virtual_point::*;
