//! Configuration for psetkv processes
//!
//! Values come from an optional TOML file, then `PSETKV_*` environment
//! variables; command line flags are applied on top by the binary.

use crate::common::{Error, Result};
use crate::kvs::sets::{parse_set_file, SetDefinition};
use crate::shm::GroupId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Group identifier, shared by every process of one launch
    #[serde(default = "default_group")]
    pub group: String,

    /// This process's rank in the group
    #[serde(default)]
    pub rank: u32,

    /// Size of the whole group at launch (initializer only)
    #[serde(default = "default_world_size")]
    pub world_size: u32,

    /// Named sets declared inline
    #[serde(default)]
    pub sets: Vec<SetDefinition>,

    /// Set-definition file (`name lower upper` per line)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_file: Option<PathBuf>,

    /// Directory holding the per-rank notification sockets
    #[serde(default = "default_notify_dir")]
    pub notify_dir: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_group() -> String {
    "psetkv".to_string()
}
fn default_world_size() -> u32 {
    1
}
fn default_notify_dir() -> PathBuf {
    std::env::temp_dir().join("psetkv")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: default_group(),
            rank: 0,
            world_size: default_world_size(),
            sets: Vec::new(),
            set_file: None,
            notify_dir: default_notify_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file and the `PSETKV_*` environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::InvalidConfig(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix("PSETKV").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        GroupId::new(&self.group)?;
        if self.world_size == 0 {
            return Err(Error::InvalidConfig("world_size must be at least 1".into()));
        }
        for set in &self.sets {
            set.validate()?;
        }
        Ok(())
    }

    pub fn group_id(&self) -> Result<GroupId> {
        GroupId::new(&self.group)
    }

    /// Inline sets followed by the sets from `set_file`, if any.
    pub fn set_definitions(&self) -> Result<Vec<SetDefinition>> {
        let mut sets = self.sets.clone();
        if let Some(path) = &self.set_file {
            sets.extend(parse_set_file(path)?);
        }
        Ok(sets)
    }
}
