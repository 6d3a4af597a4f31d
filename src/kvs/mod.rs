//! Process-set store
//!
//! - Records and layout of the shared table
//! - Growable per-entry side buffers with generation tracking
//! - The store handle and its locked operations
//! - Change notifications and set definitions

pub mod buffers;
pub mod layout;
pub mod notify;
pub mod sets;
pub mod store;

/// Identifier of one process within its group.
pub type Rank = u32;

/// Index of an entry in the shared table.
pub type SlotIndex = usize;

pub use buffers::Shadow;
pub use layout::MAX_KEY_LEN;
pub use notify::{
    Notification, NotificationListener, Notifier, NullNotifier, RecordingNotifier,
    SocketNotifier, UPDATE_CODE,
};
pub use sets::{app_key, parse_set_file, SetDefinition, APP_PREFIX, SELF_KEY, WORLD_KEY};
pub use store::{EntrySnapshot, KvStore, Membership};
