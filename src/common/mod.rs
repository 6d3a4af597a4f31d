//! Common utilities and types shared across psetkv

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use hash::{slot_hash, ProbeSequence};
pub use utils::{format_ranks, parse_rank_list, validate_key};
