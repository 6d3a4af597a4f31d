//! Utility functions for psetkv

use crate::common::{Error, Result};

/// Check that a key can be stored in a fixed-size record of `max` bytes.
///
/// Empty keys are rejected because an empty key marks a free slot.
pub fn validate_key(key: &str, max: usize) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidConfig("empty key".into()));
    }
    if key.len() > max {
        return Err(Error::KeyTooLong {
            len: key.len(),
            max,
        });
    }
    if key.as_bytes().contains(&0) {
        return Err(Error::InvalidConfig(format!(
            "key contains a NUL byte: {:?}",
            key
        )));
    }
    Ok(())
}

/// Parse a rank list such as `"0,1,4-7"`.
///
/// Items are comma separated; `a-b` expands to the inclusive range.
/// An empty string is the empty list.
pub fn parse_rank_list(s: &str) -> Result<Vec<u32>> {
    let mut ranks = Vec::new();
    for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_rank(lo)?;
                let hi = parse_rank(hi)?;
                if lo > hi {
                    return Err(Error::InvalidConfig(format!("empty rank range: {}", item)));
                }
                ranks.extend(lo..=hi);
            }
            None => ranks.push(parse_rank(item)?),
        }
    }
    Ok(ranks)
}

fn parse_rank(s: &str) -> Result<u32> {
    s.trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid rank: {}", s)))
}

/// Render ranks as a space separated list (debug dumps, CLI output).
pub fn format_ranks(ranks: &[u32]) -> String {
    ranks
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
