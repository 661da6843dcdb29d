//! inklink-sync: the phone side of the companion link: outbound and
//! inbound message paths, write throttling, sync cadence, the sync
//! coordinator, persisted sync state, and an in-process loopback device.

pub mod coordinator;
pub mod inbound;
pub mod link;
pub mod outbound;
pub mod policy;
pub mod qos;
pub mod sim;
pub mod store;

pub use coordinator::{SyncCoordinator, SyncError, SyncInput, SyncOutcome, SyncReport, SyncStage};
pub use inbound::Inbound;
pub use link::{DeviceLink, LinkError};
pub use policy::SyncPolicy;
pub use qos::RateLimiter;
pub use sim::LoopbackPeripheral;
pub use store::{StateStore, StoreError, SyncState};
