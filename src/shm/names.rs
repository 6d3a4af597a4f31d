//! Region naming
//!
//! Every process derives region names from the group identifier alone, so
//! no coordination is needed beyond agreeing on that identifier.

use crate::common::{Error, Result};
use std::fmt;

/// POSIX allows 255 bytes per shm name; keep room for the suffixes.
const MAX_GROUP_LEN: usize = 200;

/// Identifier shared by all processes of one launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidConfig("group identifier is empty".into()));
        }
        if id.len() > MAX_GROUP_LEN {
            return Err(Error::InvalidConfig(format!(
                "group identifier longer than {} bytes",
                MAX_GROUP_LEN
            )));
        }
        if id.contains('/') || id.contains('\0') {
            return Err(Error::InvalidConfig(format!(
                "group identifier may not contain '/' or NUL: {:?}",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Head,
    Entries,
    Ranks(usize),
    Updates(usize),
}

/// Name of one shared memory region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionName(String);

impl RegionName {
    pub fn new(group: &GroupId, purpose: Purpose) -> Self {
        let name = match purpose {
            Purpose::Head => format!("/{}_kvs_head", group),
            Purpose::Entries => format!("/{}_kvs_entries", group),
            Purpose::Ranks(slot) => format!("/{}_{}_ranks", group, slot),
            Purpose::Updates(slot) => format!("/{}_{}_updates", group, slot),
        };
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_group_validation() {
        assert!(GroupId::new("run-1").is_ok());
        assert!(GroupId::new("").is_err());
        assert!(GroupId::new("a/b").is_err());
        assert!(GroupId::new("x".repeat(MAX_GROUP_LEN + 1)).is_err());
    }

    #[test]
    fn test_names() {
        let g = GroupId::new("mpisessions").unwrap();
        assert_eq!(
            RegionName::new(&g, Purpose::Head).as_str(),
            "/mpisessions_kvs_head"
        );
        assert_eq!(
            RegionName::new(&g, Purpose::Entries).as_str(),
            "/mpisessions_kvs_entries"
        );
        assert_eq!(
            RegionName::new(&g, Purpose::Ranks(3)).as_str(),
            "/mpisessions_3_ranks"
        );
        assert_eq!(
            RegionName::new(&g, Purpose::Updates(3)).as_str(),
            "/mpisessions_3_updates"
        );
    }

    #[test]
    fn test_names_unique_per_slot_and_purpose() {
        let g = GroupId::new("g").unwrap();
        let mut seen = HashSet::new();
        assert!(seen.insert(RegionName::new(&g, Purpose::Head)));
        assert!(seen.insert(RegionName::new(&g, Purpose::Entries)));
        for slot in 0..64 {
            assert!(seen.insert(RegionName::new(&g, Purpose::Ranks(slot))));
            assert!(seen.insert(RegionName::new(&g, Purpose::Updates(slot))));
        }
    }

    #[test]
    fn test_names_differ_across_groups() {
        let a = GroupId::new("a").unwrap();
        let b = GroupId::new("b").unwrap();
        assert_ne!(
            RegionName::new(&a, Purpose::Ranks(0)),
            RegionName::new(&b, Purpose::Ranks(0))
        );
    }
}
