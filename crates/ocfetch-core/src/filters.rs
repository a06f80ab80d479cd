//! File filter strategies.
//!
//! Filters narrow what the SFTP directory locator considers. Two stock
//! implementations are registered: a date filter that scans file names for
//! an eight-digit `YYYYMMDD` run at or after a cutoff, and a shell-style
//! pattern filter.

use std::sync::Arc;

use crate::error::StrategyError;
use crate::model::MetaMap;
use crate::registry::{params, StrategyFactory, StrategyInstance, StrategyKind, StrategyRegistry};
use crate::strategy::FileFilter;

/// Register the stock filter factories.
pub fn register_filter_strategies(registry: &mut StrategyRegistry) {
    registry.register(StrategyKind::FileFilter, "date_filter", Arc::new(DateFilterFactory));
    registry.register(
        StrategyKind::FileFilter,
        "pattern_filter",
        Arc::new(PatternFilterFactory),
    );
}

const DATE_DIGITS: usize = 8;

/// Accepts file names carrying a `YYYYMMDD` digit run at or after the
/// start date.
#[derive(Debug, Clone)]
pub struct DateFilter {
    start_date: String,
}

impl DateFilter {
    /// Create a filter with an inclusive `YYYYMMDD` cutoff.
    #[must_use]
    pub fn new(start_date: impl Into<String>) -> Self {
        Self {
            start_date: start_date.into(),
        }
    }
}

impl FileFilter for DateFilter {
    fn accept(&self, filename: &str) -> bool {
        filename
            .split(|c: char| !c.is_ascii_digit())
            .any(|run| run.len() == DATE_DIGITS && *run >= *self.start_date)
    }
}

/// Accepts file names matching a shell-style glob pattern.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    pattern: String,
    case_sensitive: bool,
}

impl PatternFilter {
    /// Create a case-sensitive pattern filter.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            case_sensitive: true,
        }
    }

    /// Match case-insensitively.
    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self.pattern = self.pattern.to_lowercase();
        self
    }
}

impl FileFilter for PatternFilter {
    fn accept(&self, filename: &str) -> bool {
        if self.case_sensitive {
            glob_match::glob_match(&self.pattern, filename)
        } else {
            glob_match::glob_match(&self.pattern, &filename.to_lowercase())
        }
    }
}

/// Builds [`DateFilter`] instances.
pub struct DateFilterFactory;

impl StrategyFactory for DateFilterFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("date_filter", params_map, &["start_date"])?;
        let start_date = params::require_str("date_filter", params_map, "start_date")?;
        if start_date.len() != DATE_DIGITS || !start_date.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StrategyError::InvalidArgument {
                strategy: "date_filter".to_owned(),
                field: "start_date".to_owned(),
                reason: "must be YYYYMMDD".to_owned(),
            });
        }
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let start_date = params::require_str("date_filter", params_map, "start_date")?;
        Ok(StrategyInstance::Filter(Arc::new(DateFilter::new(start_date))))
    }
}

/// Builds [`PatternFilter`] instances.
pub struct PatternFilterFactory;

impl StrategyFactory for PatternFilterFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("pattern_filter", params_map, &["pattern", "case_sensitive"])?;
        params::require_str("pattern_filter", params_map, "pattern")?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let pattern = params::require_str("pattern_filter", params_map, "pattern")?;
        let case_sensitive = params_map
            .get("case_sensitive")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let filter = if case_sensitive {
            PatternFilter::new(pattern)
        } else {
            PatternFilter::new(pattern).case_insensitive()
        };
        Ok(StrategyInstance::Filter(Arc::new(filter)))
    }
}
