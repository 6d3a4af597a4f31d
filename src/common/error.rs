//! Error types for psetkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Resource Errors ===
    #[error("Shared memory {op} failed for {name}: {source}")]
    Resource {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted store: {0}")]
    Corrupted(String),

    // === Table Errors ===
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Table full: no free slot for {key} (capacity {capacity})")]
    CapacityExhausted { key: String, capacity: usize },

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Slot out of range: {slot} (capacity {capacity})")]
    SlotOutOfRange { slot: usize, capacity: usize },

    #[error("Index {index} out of range for {key} ({len} members)")]
    IndexOutOfRange {
        key: String,
        index: usize,
        len: usize,
    },

    // === Notification Errors ===
    #[error("Notification to rank {rank} failed: {reason}")]
    Notify { rank: u32, reason: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a resource error from a failed OS call on a named region.
    pub fn resource(op: &'static str, name: impl Into<String>, source: std::io::Error) -> Self {
        Error::Resource {
            op,
            name: name.into(),
            source,
        }
    }

    /// Errors after which the shared store can no longer be trusted.
    ///
    /// Callers are expected to propagate these to process exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Resource { .. } | Error::Io(_) | Error::Corrupted(_)
        )
    }

    /// Is this a lookup/capacity miss the caller may handle?
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound(_)
                | Error::CapacityExhausted { .. }
                | Error::DuplicateKey(_)
                | Error::KeyTooLong { .. }
                | Error::SlotOutOfRange { .. }
                | Error::IndexOutOfRange { .. }
        )
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let e = Error::resource(
            "shm_open",
            "/g_kvs_head",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(e.is_fatal());
        assert!(!e.is_recoverable());

        let e = Error::KeyNotFound("app://missing".into());
        assert!(e.is_recoverable());
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_resource_message_names_region() {
        let e = Error::resource(
            "mremap",
            "/g_3_ranks",
            std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        );
        let msg = e.to_string();
        assert!(msg.contains("mremap"));
        assert!(msg.contains("/g_3_ranks"));
    }
}
