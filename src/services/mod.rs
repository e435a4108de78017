//! Services - business logic and state management
//!
//! - `zone_registry` - Validated zone configuration
//! - `absence_tracker` - Per-zone absence state machine
//! - `dispatcher` - Alert delivery worker (snapshot + email/SMS)

pub mod absence_tracker;
pub mod dispatcher;
pub mod zone_registry;

pub use absence_tracker::AbsenceTracker;
pub use dispatcher::{create_dispatch_worker, AlertSender, DispatchWorker, Dispatcher, SnapshotSource};
pub use zone_registry::ZoneRegistry;
