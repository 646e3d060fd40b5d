use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keystone_constants::DEFAULT_OPERATION_TIMEOUT_MS;
use keystone_constants::MAX_OPERATION_TIMEOUT_MS;
use keystone_constants::MAX_RESERVATION_CACHE_ENTRIES;
use keystone_constants::NOTIFICATION_QUEUE_CAPACITY;
use keystone_fate::FateStoreConfig;
use keystone_fate::ReservationTakeoverPolicy;
use keystone_metadata::DataLevel;
use keystone_metadata::MetaDataStateStore;
use keystone_metadata::MetadataStore;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

/// Configuration for a keystone instance.
///
/// Configuration is loaded in layers with the following precedence (lowest to highest):
/// 1. Environment variables (KEYSTONE_*)
/// 2. TOML configuration file
/// 3. Explicit overrides from the embedding process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// Coordination-service path every keystone node lives under.
    #[serde(default = "default_instance_root")]
    pub instance_root: String,

    /// Bound on every coordination round-trip, in milliseconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// When a stale transaction reservation may be forcibly taken over.
    ///
    /// There is no safe default age; takeover stays disabled until one is configured.
    #[serde(default)]
    pub takeover_policy: ReservationTakeoverPolicy,

    /// Capacity of the local reservation cache.
    #[serde(default = "default_reservation_cache_entries")]
    pub reservation_cache_entries: usize,

    /// Capacity of each tablet state store's notification queue.
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            instance_root: default_instance_root(),
            operation_timeout_ms: default_operation_timeout_ms(),
            takeover_policy: ReservationTakeoverPolicy::default(),
            reservation_cache_entries: default_reservation_cache_entries(),
            notification_queue_capacity: default_notification_queue_capacity(),
        }
    }
}

impl KeystoneConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern KEYSTONE_<FIELD_NAME>. Takeover is enabled
    /// by KEYSTONE_TAKEOVER_THRESHOLD_MS, optionally padded by
    /// KEYSTONE_TAKEOVER_CLOCK_SKEW_ALLOWANCE_MS.
    pub fn from_env() -> Self {
        let takeover_policy = match parse_env::<u64>("KEYSTONE_TAKEOVER_THRESHOLD_MS") {
            Some(threshold_ms) => ReservationTakeoverPolicy::AfterAge {
                threshold_ms,
                clock_skew_allowance_ms: parse_env("KEYSTONE_TAKEOVER_CLOCK_SKEW_ALLOWANCE_MS").unwrap_or(0),
            },
            None => ReservationTakeoverPolicy::Disabled,
        };
        Self {
            instance_root: parse_env("KEYSTONE_INSTANCE_ROOT").unwrap_or_else(default_instance_root),
            operation_timeout_ms: parse_env("KEYSTONE_OPERATION_TIMEOUT_MS").unwrap_or_else(default_operation_timeout_ms),
            takeover_policy,
            reservation_cache_entries: parse_env("KEYSTONE_RESERVATION_CACHE_ENTRIES")
                .unwrap_or_else(default_reservation_cache_entries),
            notification_queue_capacity: parse_env("KEYSTONE_NOTIFICATION_QUEUE_CAPACITY")
                .unwrap_or_else(default_notification_queue_capacity),
        }
    }

    /// Merge configuration from another source.
    ///
    /// Fields in `other` that differ from their defaults override fields in `self`.
    pub fn merge(&mut self, other: Self) {
        if other.instance_root != default_instance_root() {
            self.instance_root = other.instance_root;
        }
        if other.operation_timeout_ms != default_operation_timeout_ms() {
            self.operation_timeout_ms = other.operation_timeout_ms;
        }
        if other.takeover_policy != ReservationTakeoverPolicy::default() {
            self.takeover_policy = other.takeover_policy;
        }
        if other.reservation_cache_entries != default_reservation_cache_entries() {
            self.reservation_cache_entries = other.reservation_cache_entries;
        }
        if other.notification_queue_capacity != default_notification_queue_capacity() {
            self.notification_queue_capacity = other.notification_queue_capacity;
        }
    }

    /// Build the effective configuration: environment, then `toml_path`, then `overrides`.
    pub fn load(toml_path: Option<&Path>, overrides: Option<Self>) -> Result<Self, ConfigError> {
        let mut config = Self::from_env();
        if let Some(path) = toml_path {
            config.merge(Self::from_toml_file(path)?);
        }
        if let Some(overrides) = overrides {
            config.merge(overrides);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.instance_root.starts_with('/') || self.instance_root == "/" {
            return Err(ConfigError::Validation {
                message: "instance_root must be an absolute path below '/'".into(),
            });
        }

        if self.operation_timeout_ms == 0 || self.operation_timeout_ms > MAX_OPERATION_TIMEOUT_MS {
            return Err(ConfigError::Validation {
                message: format!("operation_timeout_ms must be between 1 and {MAX_OPERATION_TIMEOUT_MS}"),
            });
        }

        if let ReservationTakeoverPolicy::AfterAge { threshold_ms, .. } = self.takeover_policy
            && threshold_ms == 0
        {
            return Err(ConfigError::Validation {
                message: "takeover threshold_ms must be non-zero".into(),
            });
        }

        if self.reservation_cache_entries > MAX_RESERVATION_CACHE_ENTRIES {
            return Err(ConfigError::Validation {
                message: format!("reservation_cache_entries must not exceed {MAX_RESERVATION_CACHE_ENTRIES}"),
            });
        }

        if self.notification_queue_capacity == 0 {
            return Err(ConfigError::Validation {
                message: "notification_queue_capacity must be non-zero".into(),
            });
        }

        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Tablet state store for `level` whose notification queue holds
    /// `notification_queue_capacity` events.
    pub fn tablet_state_store(
        &self,
        store: Arc<MetadataStore>,
        level: DataLevel,
    ) -> Result<MetaDataStateStore, ConfigError> {
        let capacity = NonZeroUsize::new(self.notification_queue_capacity).ok_or_else(|| ConfigError::Validation {
            message: "notification_queue_capacity must be non-zero".into(),
        })?;
        Ok(MetaDataStateStore::with_queue_capacity(store, level, capacity))
    }

    /// Settings for the transaction store.
    pub fn fate_store_config(&self) -> FateStoreConfig {
        FateStoreConfig {
            operation_timeout_ms: self.operation_timeout_ms,
            takeover_policy: self.takeover_policy,
            reservation_cache_entries: self.reservation_cache_entries,
        }
    }
}

// Default value functions
fn default_instance_root() -> String {
    "/keystone".into()
}

fn default_operation_timeout_ms() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_MS
}

fn default_reservation_cache_entries() -> usize {
    MAX_RESERVATION_CACHE_ENTRIES
}

fn default_notification_queue_capacity() -> usize {
    NOTIFICATION_QUEUE_CAPACITY
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use keystone_metadata::TabletStateStore;

    use super::*;

    fn write_toml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = KeystoneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.takeover_policy, ReservationTakeoverPolicy::Disabled);
        assert_eq!(config.notification_queue_capacity, 1_000);
    }

    #[test]
    fn test_toml_file() {
        let file = write_toml(
            r#"
            instance_root = "/accumulo/4f2c"
            operation_timeout_ms = 2500

            [takeover_policy]
            mode = "after_age"
            threshold_ms = 600000
            clock_skew_allowance_ms = 30000
            "#,
        );
        let config = KeystoneConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.instance_root, "/accumulo/4f2c");
        assert_eq!(config.operation_timeout(), Duration::from_millis(2500));
        assert_eq!(config.takeover_policy.min_age_ms(), Some(630_000));
        assert_eq!(config.reservation_cache_entries, MAX_RESERVATION_CACHE_ENTRIES);
    }

    #[test]
    fn test_bad_toml_reports_path() {
        let file = write_toml("operation_timeout_ms = \"soon\"");
        let err = KeystoneConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_missing_file() {
        let err = KeystoneConfig::from_toml_file(Path::new("/nonexistent/keystone.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_merge_prefers_non_default_fields() {
        let mut base = KeystoneConfig {
            instance_root: "/from-env".into(),
            ..KeystoneConfig::default()
        };
        base.merge(KeystoneConfig {
            operation_timeout_ms: 500,
            ..KeystoneConfig::default()
        });
        assert_eq!(base.instance_root, "/from-env");
        assert_eq!(base.operation_timeout_ms, 500);
    }

    #[test]
    fn test_load_applies_overrides_last() {
        let file = write_toml("instance_root = \"/from-file\"\noperation_timeout_ms = 700");
        let overrides = KeystoneConfig {
            operation_timeout_ms: 900,
            ..KeystoneConfig::default()
        };
        let config = KeystoneConfig::load(Some(file.path()), Some(overrides)).unwrap();
        assert_eq!(config.instance_root, "/from-file");
        assert_eq!(config.operation_timeout_ms, 900);
    }

    #[test]
    fn test_validation() {
        let invalid = [
            KeystoneConfig {
                instance_root: "relative".into(),
                ..KeystoneConfig::default()
            },
            KeystoneConfig {
                operation_timeout_ms: 0,
                ..KeystoneConfig::default()
            },
            KeystoneConfig {
                operation_timeout_ms: MAX_OPERATION_TIMEOUT_MS + 1,
                ..KeystoneConfig::default()
            },
            KeystoneConfig {
                takeover_policy: ReservationTakeoverPolicy::AfterAge {
                    threshold_ms: 0,
                    clock_skew_allowance_ms: 10,
                },
                ..KeystoneConfig::default()
            },
            KeystoneConfig {
                notification_queue_capacity: 0,
                ..KeystoneConfig::default()
            },
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(ConfigError::Validation { .. })), "{config:?}");
        }
    }

    #[tokio::test]
    async fn test_tablet_state_store_uses_queue_capacity() {
        let config = KeystoneConfig {
            notification_queue_capacity: 2,
            ..KeystoneConfig::default()
        };
        let client = keystone_testing::DeterministicCoordinationClient::new();
        let store = Arc::new(
            MetadataStore::open(client, &config.instance_root, config.operation_timeout()).await.unwrap(),
        );
        let state = config.tablet_state_store(store.clone(), DataLevel::User).unwrap();
        let tablet = keystone_metadata::TabletMetadata::new(keystone_metadata::KeyExtent::new("1", None, None));
        let event = || keystone_metadata::TabletManagement::state_change(tablet.clone());
        assert!(state.add_event(event()));
        assert!(state.add_event(event()));
        assert!(!state.add_event(event()));

        let zero = KeystoneConfig {
            notification_queue_capacity: 0,
            ..KeystoneConfig::default()
        };
        assert!(matches!(zero.tablet_state_store(store, DataLevel::User), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_fate_store_config() {
        let config = KeystoneConfig {
            operation_timeout_ms: 1_234,
            ..KeystoneConfig::default()
        };
        let fate = config.fate_store_config();
        assert_eq!(fate.operation_timeout_ms, 1_234);
        assert_eq!(fate.takeover_policy, ReservationTakeoverPolicy::Disabled);
    }
}
