//! Configuration loading and management.

use std::path::Path;
use std::time::Duration;

use dirsync_proto::Dn;
use serde::Deserialize;

use crate::error::ConfigError;

/// Replica configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Identifier of this replica, unique across the topology.
    pub replica_id: u16,
    /// Base DN of the replicated subtree (e.g., "dc=example,dc=com").
    pub base_dn: String,
    /// How long historical information is kept before purge, in
    /// milliseconds.
    #[serde(default = "defaults::purge_delay_ms")]
    pub purge_delay_ms: u64,
    /// How often committed changes are flushed to the outbound channel, in
    /// milliseconds.
    #[serde(default = "defaults::flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Conflict-resolution settings.
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Assured-replication settings.
    #[serde(default)]
    pub assured: AssuredConfig,
}

/// Conflict-resolution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound on replay attempts for one update before it is marked
    /// unresolved.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { max_attempts: defaults::max_attempts() }
    }
}

/// Assured-replication settings. When enabled, a local write blocks until
/// `quorum` replicas acknowledged it or the timeout elapsed.
#[derive(Debug, Clone, Deserialize)]
pub struct AssuredConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::quorum")]
    pub quorum: usize,
    #[serde(default = "defaults::assured_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AssuredConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quorum: defaults::quorum(),
            timeout_ms: defaults::assured_timeout_ms(),
        }
    }
}

mod defaults {
    // Three days, matching the usual purge window for tombstone data.
    pub fn purge_delay_ms() -> u64 {
        3 * 24 * 60 * 60 * 1000
    }

    pub fn flush_interval_ms() -> u64 {
        200
    }

    pub fn max_attempts() -> u32 {
        10
    }

    pub fn quorum() -> usize {
        1
    }

    pub fn assured_timeout_ms() -> u64 {
        2000
    }
}

impl ReplicaConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ReplicaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_dn.parse::<Dn>().is_err() || self.base_dn.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "base_dn is not a valid DN: {:?}",
                self.base_dn
            )));
        }
        if self.resolver.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "resolver.max_attempts must be at least 1".into(),
            ));
        }
        if self.assured.enabled && self.assured.quorum == 0 {
            return Err(ConfigError::Invalid(
                "assured.quorum must be at least 1 when assured mode is on".into(),
            ));
        }
        Ok(())
    }

    /// The configured base DN, parsed.
    #[must_use]
    pub fn base_dn(&self) -> Dn {
        // validate() ran at load time.
        self.base_dn.parse().unwrap_or_else(|_| Dn::root())
    }

    #[must_use]
    pub fn purge_delay(&self) -> Duration {
        Duration::from_millis(self.purge_delay_ms)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(toml: &str) -> Result<ReplicaConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        ReplicaConfig::load(file.path())
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = load_str(
            r#"
            replica_id = 7
            base_dn = "dc=example,dc=com"
            "#,
        )
        .unwrap();
        assert_eq!(config.replica_id, 7);
        assert_eq!(config.resolver.max_attempts, 10);
        assert!(!config.assured.enabled);
        assert_eq!(config.purge_delay(), Duration::from_millis(259_200_000));
    }

    #[test]
    fn test_full_config() {
        let config = load_str(
            r#"
            replica_id = 2
            base_dn = "dc=example"
            purge_delay_ms = 60000
            flush_interval_ms = 50

            [resolver]
            max_attempts = 3

            [assured]
            enabled = true
            quorum = 2
            timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.resolver.max_attempts, 3);
        assert!(config.assured.enabled);
        assert_eq!(config.assured.quorum, 2);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = load_str(
            r#"
            replica_id = 1
            base_dn = "dc=example"
            [resolver]
            max_attempts = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_replica_id_rejected() {
        let err = load_str(r#"base_dn = "dc=example""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
