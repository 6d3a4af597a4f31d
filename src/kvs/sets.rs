//! Process-set names and definitions

use crate::common::{Error, Result};
use crate::kvs::Rank;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Key of the set holding every process of the group.
pub const WORLD_KEY: &str = "mpi://WORLD";

/// Reserved key answering with the caller alone. Never stored.
pub const SELF_KEY: &str = "mpi://SELF";

/// Prefix of user-declared sets.
pub const APP_PREFIX: &str = "app://";

/// A named set declared at launch: ranks `lower..=upper`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDefinition {
    pub name: String,
    pub lower: Rank,
    pub upper: Rank,
}

impl SetDefinition {
    pub fn new(name: impl Into<String>, lower: Rank, upper: Rank) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
        }
    }

    /// Parse one line of a set file: `name lower upper`.
    ///
    /// Fields may be separated by spaces, tabs, `,`, `.` or `-`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line
            .split(|c: char| matches!(c, ' ' | '\t' | ',' | '.' | '-'))
            .filter(|f| !f.is_empty());
        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| Error::InvalidConfig(format!("set line missing {}: {:?}", what, line)))
        };
        let name = next("name")?.to_string();
        let lower = parse_bound(next("lower bound")?, line)?;
        let upper = parse_bound(next("upper bound")?, line)?;
        let set = Self { name, lower, upper };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("set name is empty".into()));
        }
        if self.lower > self.upper {
            return Err(Error::InvalidConfig(format!(
                "set {}: lower bound {} above upper bound {}",
                self.name, self.lower, self.upper
            )));
        }
        Ok(())
    }

    /// Key the set is stored under.
    pub fn key(&self) -> String {
        app_key(&self.name)
    }

    pub fn ranks(&self) -> Vec<Rank> {
        (self.lower..=self.upper).collect()
    }
}

fn parse_bound(s: &str, line: &str) -> Result<Rank> {
    s.trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid rank bound {:?} in {:?}", s, line)))
}

pub fn app_key(name: &str) -> String {
    format!("{}{}", APP_PREFIX, name)
}

/// Read a set file; blank lines and `#` comments are skipped.
pub fn parse_set_file(path: impl AsRef<Path>) -> Result<Vec<SetDefinition>> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(SetDefinition::parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_line_separators() {
        assert_eq!(
            SetDefinition::parse_line("ocean 0 3").unwrap(),
            SetDefinition::new("ocean", 0, 3)
        );
        assert_eq!(
            SetDefinition::parse_line("land,4-7").unwrap(),
            SetDefinition::new("land", 4, 7)
        );
        assert_eq!(
            SetDefinition::parse_line("ice\t8.9").unwrap(),
            SetDefinition::new("ice", 8, 9)
        );
    }

    #[test]
    fn test_parse_line_errors() {
        assert!(SetDefinition::parse_line("ocean 0").is_err());
        assert!(SetDefinition::parse_line("ocean a b").is_err());
        assert!(SetDefinition::parse_line("ocean 5 2").is_err());
    }

    #[test]
    fn test_key_and_ranks() {
        let set = SetDefinition::new("ocean", 2, 4);
        assert_eq!(set.key(), "app://ocean");
        assert_eq!(set.ranks(), vec![2, 3, 4]);
    }

    #[test]
    fn test_parse_set_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sets");
        std::fs::write(&path, "# launch sets\nocean 0 1\n\nland 2 3\n").unwrap();
        let sets = parse_set_file(&path).unwrap();
        assert_eq!(
            sets,
            vec![
                SetDefinition::new("ocean", 0, 1),
                SetDefinition::new("land", 2, 3)
            ]
        );
    }
}
