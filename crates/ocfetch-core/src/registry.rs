//! Strategy registry.
//!
//! A typed map from `(kind, name)` to a factory. Recipe configuration
//! (YAML) names strategies; factories validate the parameter object —
//! rejecting unknown fields — and build the instance. The protocol crates
//! register their factories here at application start.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::StrategyError;
use crate::model::MetaMap;
use crate::strategy::{BundleLoader, BundleLocator, FileFilter};

/// The interfaces a strategy can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Produces bundle refs.
    BundleLocator,
    /// Consumes queued requests.
    BundleLoader,
    /// Filters remote file names.
    FileFilter,
}

impl StrategyKind {
    /// Human-readable kind name used in errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::BundleLocator => "locator",
            Self::BundleLoader => "loader",
            Self::FileFilter => "filter",
        }
    }
}

/// A built strategy instance.
pub enum StrategyInstance {
    /// A bundle locator.
    Locator(Arc<dyn BundleLocator>),
    /// A bundle loader.
    Loader(Arc<dyn BundleLoader>),
    /// A file filter.
    Filter(Arc<dyn FileFilter>),
}

impl std::fmt::Debug for StrategyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Locator(_) => "Locator",
            Self::Loader(_) => "Loader",
            Self::Filter(_) => "Filter",
        };
        f.debug_tuple(kind).finish()
    }
}

impl StrategyInstance {
    /// Unwrap a locator.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::WrongKind`] otherwise.
    pub fn into_locator(self, name: &str) -> Result<Arc<dyn BundleLocator>, StrategyError> {
        match self {
            Self::Locator(locator) => Ok(locator),
            _ => Err(StrategyError::WrongKind {
                name: name.to_owned(),
                expected: "locator".to_owned(),
            }),
        }
    }

    /// Unwrap a loader.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::WrongKind`] otherwise.
    pub fn into_loader(self, name: &str) -> Result<Arc<dyn BundleLoader>, StrategyError> {
        match self {
            Self::Loader(loader) => Ok(loader),
            _ => Err(StrategyError::WrongKind {
                name: name.to_owned(),
                expected: "loader".to_owned(),
            }),
        }
    }

    /// Unwrap a filter.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::WrongKind`] otherwise.
    pub fn into_filter(self, name: &str) -> Result<Arc<dyn FileFilter>, StrategyError> {
        match self {
            Self::Filter(filter) => Ok(filter),
            _ => Err(StrategyError::WrongKind {
                name: name.to_owned(),
                expected: "filter".to_owned(),
            }),
        }
    }
}

/// Builds strategy instances from validated parameter objects.
pub trait StrategyFactory: Send + Sync {
    /// Check the parameters without building. Must fail with
    /// [`StrategyError::InvalidArgument`] naming the offending field, and
    /// reject fields outside the factory's closed set.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] for bad parameters.
    fn validate(&self, params: &MetaMap) -> Result<(), StrategyError>;

    /// Build an instance. Implementations may assume `validate` passed.
    /// The registry is available for resolving nested strategies (e.g. a
    /// locator's file filter).
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError`] when construction fails.
    fn create(
        &self,
        params: &MetaMap,
        registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError>;
}

/// Name-indexed registry of strategy factories.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<(StrategyKind, String), Arc<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `(kind, name)`, replacing any previous one.
    pub fn register(
        &mut self,
        kind: StrategyKind,
        name: impl Into<String>,
        factory: Arc<dyn StrategyFactory>,
    ) {
        self.factories.insert((kind, name.into()), factory);
    }

    /// Validate parameters and build an instance.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::Unknown`] when nothing is registered under
    /// `(kind, name)`, or the factory's validation/creation error.
    pub fn create(
        &self,
        kind: StrategyKind,
        name: &str,
        params: &MetaMap,
    ) -> Result<StrategyInstance, StrategyError> {
        let factory =
            self.factories
                .get(&(kind, name.to_owned()))
                .ok_or_else(|| StrategyError::Unknown {
                    kind: kind.name().to_owned(),
                    name: name.to_owned(),
                })?;
        factory.validate(params)?;
        factory.create(params, self)
    }

    /// Registered names for one kind, sorted.
    #[must_use]
    pub fn names(&self, kind: StrategyKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}

/// Validation helpers shared by the factories in the protocol crates.
pub mod params {
    use super::{MetaMap, StrategyError, StrategyInstance, StrategyKind, StrategyRegistry, Value};

    /// Resolve an optional nested strategy reference of the shape
    /// `{"strategy": name, "params": {...}}`.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError`] when the reference is malformed or the
    /// nested strategy fails to build.
    pub fn optional_strategy(
        strategy: &str,
        params: &MetaMap,
        field: &str,
        kind: StrategyKind,
        registry: &StrategyRegistry,
    ) -> Result<Option<StrategyInstance>, StrategyError> {
        let Some(value) = params.get(field) else {
            return Ok(None);
        };
        let invalid = |reason: &str| StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: field.to_owned(),
            reason: reason.to_owned(),
        };
        let Some(reference) = value.as_object() else {
            return Err(invalid("must be an object with 'strategy' and 'params'"));
        };
        reject_unknown(strategy, reference, &["strategy", "params"])?;
        let name = require_str(strategy, reference, "strategy")?;
        let nested = reference
            .get("params")
            .map(|p| {
                p.as_object()
                    .cloned()
                    .ok_or_else(|| invalid("'params' must be an object"))
            })
            .transpose()?
            .unwrap_or_default();
        registry.create(kind, name, &nested).map(Some)
    }

    /// Reject fields outside the allowed set.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] naming the first unknown
    /// field.
    pub fn reject_unknown(
        strategy: &str,
        params: &MetaMap,
        allowed: &[&str],
    ) -> Result<(), StrategyError> {
        for field in params.keys() {
            if !allowed.contains(&field.as_str()) {
                return Err(StrategyError::InvalidArgument {
                    strategy: strategy.to_owned(),
                    field: field.clone(),
                    reason: "unknown field".to_owned(),
                });
            }
        }
        Ok(())
    }

    /// A required string field.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] when missing or not a
    /// string.
    pub fn require_str<'a>(
        strategy: &str,
        params: &'a MetaMap,
        field: &str,
    ) -> Result<&'a str, StrategyError> {
        params
            .get(field)
            .ok_or_else(|| StrategyError::InvalidArgument {
                strategy: strategy.to_owned(),
                field: field.to_owned(),
                reason: "missing required field".to_owned(),
            })?
            .as_str()
            .ok_or_else(|| StrategyError::InvalidArgument {
                strategy: strategy.to_owned(),
                field: field.to_owned(),
                reason: "must be a string".to_owned(),
            })
    }

    /// An optional string field.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] when present but not a
    /// string.
    pub fn optional_str<'a>(
        strategy: &str,
        params: &'a MetaMap,
        field: &str,
    ) -> Result<Option<&'a str>, StrategyError> {
        match params.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| StrategyError::InvalidArgument {
                    strategy: strategy.to_owned(),
                    field: field.to_owned(),
                    reason: "must be a string".to_owned(),
                }),
        }
    }

    /// An optional unsigned integer field.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] when present but not a
    /// non-negative integer.
    pub fn optional_u64(
        strategy: &str,
        params: &MetaMap,
        field: &str,
    ) -> Result<Option<u64>, StrategyError> {
        match params.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| StrategyError::InvalidArgument {
                    strategy: strategy.to_owned(),
                    field: field.to_owned(),
                    reason: "must be a non-negative integer".to_owned(),
                }),
        }
    }

    /// An optional float field (integers are accepted).
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] when present but not a
    /// number.
    pub fn optional_f64(
        strategy: &str,
        params: &MetaMap,
        field: &str,
    ) -> Result<Option<f64>, StrategyError> {
        match params.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| StrategyError::InvalidArgument {
                    strategy: strategy.to_owned(),
                    field: field.to_owned(),
                    reason: "must be a number".to_owned(),
                }),
        }
    }

    /// An optional list-of-strings field.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::InvalidArgument`] when present but not a
    /// string array.
    pub fn optional_str_list(
        strategy: &str,
        params: &MetaMap,
        field: &str,
    ) -> Result<Option<Vec<String>>, StrategyError> {
        let invalid = || StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: field.to_owned(),
            reason: "must be an array of strings".to_owned(),
        };
        match params.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_owned).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperFilterFactory;

    impl StrategyFactory for UpperFilterFactory {
        fn validate(&self, params: &MetaMap) -> Result<(), StrategyError> {
            params::reject_unknown("upper_filter", params, &["prefix"])?;
            params::require_str("upper_filter", params, "prefix")?;
            Ok(())
        }

        fn create(
            &self,
            params: &MetaMap,
            _registry: &StrategyRegistry,
        ) -> Result<StrategyInstance, StrategyError> {
            let prefix = params::require_str("upper_filter", params, "prefix")?.to_owned();
            Ok(StrategyInstance::Filter(Arc::new(move |name: &str| {
                name.starts_with(&prefix)
            })))
        }
    }

    fn params_of(json: serde_json::Value) -> MetaMap {
        json.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn create_builds_registered_strategy() {
        let mut registry = StrategyRegistry::new();
        registry.register(
            StrategyKind::FileFilter,
            "upper_filter",
            Arc::new(UpperFilterFactory),
        );

        let instance = registry
            .create(
                StrategyKind::FileFilter,
                "upper_filter",
                &params_of(serde_json::json!({"prefix": "2024"})),
            )
            .unwrap();
        let filter = instance.into_filter("upper_filter").unwrap();
        assert!(filter.accept("20240115_data.txt"));
        assert!(!filter.accept("old.txt"));
    }

    #[test]
    fn unknown_strategy_is_reported() {
        let registry = StrategyRegistry::new();
        let err = registry
            .create(StrategyKind::BundleLoader, "nope", &MetaMap::new())
            .unwrap_err();
        assert!(matches!(err, StrategyError::Unknown { .. }));
    }

    #[test]
    fn validation_names_offending_field() {
        let mut registry = StrategyRegistry::new();
        registry.register(
            StrategyKind::FileFilter,
            "upper_filter",
            Arc::new(UpperFilterFactory),
        );

        // Missing required field.
        let err = registry
            .create(StrategyKind::FileFilter, "upper_filter", &MetaMap::new())
            .unwrap_err();
        match &err {
            StrategyError::InvalidArgument { field, .. } => assert_eq!(field, "prefix"),
            other => panic!("unexpected error: {other}"),
        }

        // Unknown field rejected.
        let err = registry
            .create(
                StrategyKind::FileFilter,
                "upper_filter",
                &params_of(serde_json::json!({"prefix": "a", "bogus": 1})),
            )
            .unwrap_err();
        match &err {
            StrategyError::InvalidArgument { field, .. } => assert_eq!(field, "bogus"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_kind_unwrap_is_rejected() {
        let mut registry = StrategyRegistry::new();
        registry.register(
            StrategyKind::FileFilter,
            "upper_filter",
            Arc::new(UpperFilterFactory),
        );
        let instance = registry
            .create(
                StrategyKind::FileFilter,
                "upper_filter",
                &params_of(serde_json::json!({"prefix": "x"})),
            )
            .unwrap();
        assert!(matches!(
            instance.into_loader("upper_filter"),
            Err(StrategyError::WrongKind { .. })
        ));
    }

    #[test]
    fn names_lists_by_kind() {
        let mut registry = StrategyRegistry::new();
        registry.register(
            StrategyKind::FileFilter,
            "b_filter",
            Arc::new(UpperFilterFactory),
        );
        registry.register(
            StrategyKind::FileFilter,
            "a_filter",
            Arc::new(UpperFilterFactory),
        );
        assert_eq!(registry.names(StrategyKind::FileFilter), vec!["a_filter", "b_filter"]);
        assert!(registry.names(StrategyKind::BundleLoader).is_empty());
    }
}
