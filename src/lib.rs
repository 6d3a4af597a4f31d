//! # psetkv
//!
//! A shared-memory process-set store for groups of cooperating processes:
//! - One fixed-capacity hash table per group, in named shared memory
//! - Growable per-entry member lists, remapped lazily by every process
//! - A single process-shared lock serializing all compound operations
//! - One-shot change notifications to subscribed ranks
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ /<group>_kvs_head                             │
//! │  magic | capacity | global version | lock     │
//! └───────────────────────┬───────────────────────┘
//!                         │
//! ┌───────────────────────▼───────────────────────┐
//! │ /<group>_kvs_entries                          │
//! │  slot 0 │ slot 1 │ ... │ slot C-1             │
//! │  key, version, generation, counts, capacities │
//! └───┬───────────────────────────────────┬───────┘
//!     │                                   │
//! ┌───▼────────────────┐          ┌───────▼────────────┐
//! │ /<group>_i_ranks   │   ...    │ /<group>_i_updates │
//! │  members           │          │  pending watchers  │
//! └────────────────────┘          └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Initialize a group (one process)
//! ```bash
//! psetkv --group job42 init --world-size 8 --set ocean:0-3 --set land:4-7
//! ```
//!
//! ### Query and modify from any rank
//! ```bash
//! psetkv --group job42 --rank 3 get app://ocean
//! psetkv --group job42 --rank 3 add app://land 3
//! psetkv --group job42 --rank 3 del app://land 0
//! psetkv --group job42 --rank 5 watch app://ocean
//! ```
//!
//! ### Tear down
//! ```bash
//! psetkv --group job42 destroy
//! ```

pub mod common;
pub mod kvs;
pub mod shm;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use kvs::{KvStore, Membership, Notifier, Rank, SetDefinition, SlotIndex};
pub use shm::GroupId;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
