use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

//protocol settings
pub const DEFAULT_SHARD_SIZE: usize = 4;
pub const DEFAULT_SESSION_TTL_MS: u64 = 30_000;
pub const DEFAULT_RETENTION_MS: u64 = 120_000;
pub const DEFAULT_REGISTRATION_GRACE_MS: u64 = 3_600_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Shard size must be at least 1")]
    InvalidShardSize,
    #[error("Invalid bootstrap process id: '{}'", .0)]
    InvalidBootstrapId(String),
}

/// Settings of the broadcast engine.
///
/// `shard_size` bounds the outbound fan-out of a single relay hop. Larger
/// values trade more messages per hop for fewer hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbrbConfig {
    pub shard_size: usize,
    /// How long a session that made no progress is kept before it is
    /// reported as abandoned and dropped.
    pub session_ttl_ms: u64,
    /// How long a delivered session is kept around to absorb replays.
    pub retention_ms: u64,
    /// How long before its registration expires a process should re-register.
    pub registration_grace_ms: u64,
    /// Base58 ids of processes that are members of every view.
    #[serde(default)]
    pub bootstrap_processes: Vec<String>,
}

impl Default for DbrbConfig {
    fn default() -> Self {
        DbrbConfig {
            shard_size: DEFAULT_SHARD_SIZE,
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            retention_ms: DEFAULT_RETENTION_MS,
            registration_grace_ms: DEFAULT_REGISTRATION_GRACE_MS,
            bootstrap_processes: vec![],
        }
    }
}

impl DbrbConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: DbrbConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_size == 0 {
            return Err(ConfigError::InvalidShardSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_toml() {
        let config: DbrbConfig = toml::from_str(
            r#"
            shard_size = 6
            session_ttl_ms = 10000
            retention_ms = 60000
            registration_grace_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.shard_size, 6);
        assert!(config.bootstrap_processes.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_shard_size_rejected() {
        let config = DbrbConfig {
            shard_size: 0,
            ..DbrbConfig::default()
        };
        assert_matches!(config.validate(), Err(ConfigError::InvalidShardSize));
    }
}
