//! Startup configuration.
//!
//! A [`Config`] is assembled once, either through [`ConfigBuilder`] or from
//! TOML, and handed to the [`Repository`](crate::repository::Repository).
//! It is read-only afterwards.
//!
//! ```toml
//! [snapshots]
//! threshold = 100
//!
//! [snapshots.aggregates]
//! giftcard = 10
//!
//! [items]
//! region = "eu-west-1"
//! ```

use std::{collections::HashMap, num::NonZeroU32};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{aggregate::Aggregate, snapshot::SnapshotStrategy};

/// Error raised while building or reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),
    #[error("configuration key `{key}` does not hold a `{expected}`: {source}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for configuration key `{key}`: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot threshold for {scope} must be greater than zero")]
    InvalidThreshold { scope: String },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Immutable configuration value.
#[derive(Clone, Debug)]
pub struct Config {
    global: SnapshotStrategy,
    strategies: HashMap<String, SnapshotStrategy>,
    items: HashMap<String, serde_json::Value>,
}

impl Config {
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents or unknown
    /// keys, and [`ConfigError::InvalidThreshold`] for zero thresholds.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(document)?;
        let mut builder = Self::builder();
        if let Some(threshold) = settings.snapshots.threshold {
            builder = builder.snapshot_threshold(threshold);
        }
        for (kind, threshold) in settings.snapshots.aggregates {
            builder = builder.snapshot_threshold_for_kind(kind, threshold);
        }
        builder.items.extend(settings.items);
        builder.build()
    }

    /// The one strategy consulted when saving an aggregate of this kind.
    ///
    /// A strategy registered for the kind wins over the global one.
    #[must_use]
    pub fn snapshot_strategy(&self, aggregate_kind: &str) -> &SnapshotStrategy {
        self.strategies.get(aggregate_kind).unwrap_or(&self.global)
    }

    #[must_use]
    pub fn snapshot_strategy_for<A: Aggregate>(&self) -> &SnapshotStrategy {
        self.snapshot_strategy(A::KIND)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Typed read of a configuration item.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownKey`] if no item was registered under
    /// `key`, or [`ConfigError::TypeMismatch`] if it does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self
            .items
            .get(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        T::deserialize(value).map_err(|source| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            source,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: SnapshotStrategy::default(),
            strategies: HashMap::new(),
            items: HashMap::new(),
        }
    }
}

/// Builder for [`Config`].
///
/// Registrations are validated in [`build`](Self::build), so a bad
/// configuration fails at startup rather than on the first save.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    global_threshold: Option<u32>,
    thresholds: HashMap<String, u32>,
    items: HashMap<String, serde_json::Value>,
    errors: Vec<ConfigError>,
}

impl ConfigBuilder {
    /// Threshold of the global strategy (default 100).
    #[must_use]
    pub const fn snapshot_threshold(mut self, threshold: u32) -> Self {
        self.global_threshold = Some(threshold);
        self
    }

    /// Threshold for aggregate type `A`, replacing any earlier registration.
    #[must_use]
    pub fn snapshot_threshold_for<A: Aggregate>(self, threshold: u32) -> Self {
        self.snapshot_threshold_for_kind(A::KIND, threshold)
    }

    /// Threshold for an aggregate kind, replacing any earlier registration.
    #[must_use]
    pub fn snapshot_threshold_for_kind(mut self, kind: impl Into<String>, threshold: u32) -> Self {
        self.thresholds.insert(kind.into(), threshold);
        self
    }

    /// Register a typed configuration item, replacing any earlier value.
    #[must_use]
    pub fn item(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.items.insert(key, value);
            }
            Err(source) => self.errors.push(ConfigError::InvalidValue { key, source }),
        }
        self
    }

    /// # Errors
    ///
    /// Returns the first invalid registration: a zero threshold or an item
    /// that failed to serialize.
    pub fn build(self) -> Result<Config, ConfigError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let global = match self.global_threshold {
            Some(threshold) => {
                SnapshotStrategy::global(non_zero(threshold, "the global strategy")?)
            }
            None => SnapshotStrategy::default(),
        };

        let strategies = self
            .thresholds
            .into_iter()
            .map(|(kind, threshold)| {
                let threshold = non_zero(threshold, &format!("aggregate kind `{kind}`"))?;
                Ok((kind.clone(), SnapshotStrategy::for_kind(kind, threshold)))
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(Config {
            global,
            strategies,
            items: self.items,
        })
    }
}

fn non_zero(threshold: u32, scope: &str) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(threshold).ok_or_else(|| ConfigError::InvalidThreshold {
        scope: scope.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Settings {
    snapshots: SnapshotSettings,
    items: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SnapshotSettings {
    threshold: Option<u32>,
    aggregates: HashMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counter, Ledger};

    #[test]
    fn default_global_threshold_is_one_hundred() {
        let config = Config::default();
        let strategy = config.snapshot_strategy("anything");
        assert_eq!(strategy.threshold().get(), 100);
        assert_eq!(strategy.aggregate_kind(), None);
    }

    #[test]
    fn type_specific_strategy_overrides_global_only_for_that_type() {
        let config = Config::builder()
            .snapshot_threshold(50)
            .snapshot_threshold_for::<Counter>(10)
            .build()
            .unwrap();

        let counter = config.snapshot_strategy_for::<Counter>();
        assert_eq!(counter.threshold().get(), 10);
        assert!(counter.is_due(Counter::KIND, 10));

        let ledger = config.snapshot_strategy_for::<Ledger>();
        assert_eq!(ledger.threshold().get(), 50);
        assert!(!ledger.is_due(Ledger::KIND, 10));
        assert!(ledger.is_due(Ledger::KIND, 50));
    }

    #[test]
    fn re_registering_a_type_replaces_prior_strategy() {
        let config = Config::builder()
            .snapshot_threshold_for::<Counter>(10)
            .snapshot_threshold_for::<Counter>(25)
            .build()
            .unwrap();
        assert_eq!(config.snapshot_strategy_for::<Counter>().threshold().get(), 25);
    }

    #[test]
    fn zero_threshold_fails_at_build() {
        let err = Config::builder()
            .snapshot_threshold_for::<Counter>(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
        assert!(err.to_string().contains("counter"));

        let err = Config::builder().snapshot_threshold(0).build().unwrap_err();
        assert!(err.to_string().contains("global"));
    }

    #[test]
    fn typed_items_read_back() {
        let config = Config::builder()
            .item("region", "eu-west-1")
            .item("retries", 3_u32)
            .build()
            .unwrap();

        assert!(config.contains("region"));
        assert_eq!(config.get::<String>("region").unwrap(), "eu-west-1");
        assert_eq!(config.get::<u32>("retries").unwrap(), 3);
    }

    #[test]
    fn unknown_item_key_is_reported() {
        let config = Config::default();
        let err = config.get::<String>("missing").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(key) if key == "missing"));
    }

    #[test]
    fn item_type_mismatch_is_reported() {
        let config = Config::builder().item("retries", "three").build().unwrap();
        let err = config.get::<u32>("retries").unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { expected: "u32", .. }));
    }

    #[test]
    fn loads_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [snapshots]
            threshold = 40

            [snapshots.aggregates]
            counter = 4

            [items]
            region = "eu-west-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.snapshot_strategy("ledger").threshold().get(), 40);
        assert_eq!(config.snapshot_strategy("counter").threshold().get(), 4);
        assert_eq!(config.get::<String>("region").unwrap(), "eu-west-1");
    }

    #[test]
    fn toml_with_unknown_key_is_rejected() {
        let err = Config::from_toml_str("[snapshots]\nthreshhold = 40\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_with_zero_threshold_is_rejected() {
        let err = Config::from_toml_str("[snapshots.aggregates]\ncounter = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }
}
