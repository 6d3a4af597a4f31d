//! Shared memory plumbing
//!
//! - Region naming derived from the group identifier
//! - Named regions that can be created, opened, grown and destroyed
//! - A process-shared lock embedded in a region

pub mod lock;
pub mod names;
pub mod region;

pub use lock::{LockGuard, SemaphoreLock, TableLock};
pub use names::{GroupId, Purpose, RegionName};
pub use region::SharedRegion;
