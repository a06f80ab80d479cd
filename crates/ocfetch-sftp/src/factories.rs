//! Strategy factories for the SFTP layer.
//!
//! Registered into the core registry as `sftp_loader`,
//! `sftp_directory_locator`, and `sftp_file_locator`. Pools are resolved
//! through a shared [`SftpManager`] at creation time, so a recipe's loader
//! and locators share their endpoint's rate gate.

use std::sync::Arc;
use std::time::Duration;

use ocfetch_core::error::StrategyError;
use ocfetch_core::model::MetaMap;
use ocfetch_core::registry::{
    params, StrategyFactory, StrategyInstance, StrategyKind, StrategyRegistry,
};

use crate::config::SftpProtocolConfig;
use crate::loader::SftpBundleLoader;
use crate::locators::{DirectorySftpLocator, FileSftpLocator};
use crate::manager::SftpManager;
use crate::pool::SftpConnectionPool;

/// Register every SFTP strategy factory.
pub fn register_sftp_strategies(registry: &mut StrategyRegistry, manager: Arc<SftpManager>) {
    registry.register(
        StrategyKind::BundleLoader,
        "sftp_loader",
        Arc::new(SftpLoaderFactory {
            manager: Arc::clone(&manager),
        }),
    );
    registry.register(
        StrategyKind::BundleLocator,
        "sftp_directory_locator",
        Arc::new(SftpDirectoryLocatorFactory {
            manager: Arc::clone(&manager),
        }),
    );
    registry.register(
        StrategyKind::BundleLocator,
        "sftp_file_locator",
        Arc::new(SftpFileLocatorFactory { manager }),
    );
}

fn sftp_config_from(strategy: &str, params_map: &MetaMap) -> Result<SftpProtocolConfig, StrategyError> {
    let config_name = params::require_str(strategy, params_map, "config_name")?;
    let mut config = SftpProtocolConfig::new(config_name);
    if let Some(timeout) = params::optional_f64(strategy, params_map, "connect_timeout_secs")? {
        config.connect_timeout = Duration::from_secs_f64(timeout);
    }
    if let Some(rate) =
        params::optional_f64(strategy, params_map, "rate_limit_requests_per_second")?
    {
        config.rate_limit_requests_per_second = rate;
    }
    if let Some(retries) = params::optional_u64(strategy, params_map, "max_retries")? {
        config.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
    }
    if let Some(base_dir) = params::optional_str(strategy, params_map, "base_dir")? {
        config.base_dir = Some(base_dir.to_owned());
    }
    Ok(config)
}

fn pool_from(
    strategy: &str,
    manager: &SftpManager,
    params_map: &MetaMap,
) -> Result<Arc<SftpConnectionPool>, StrategyError> {
    let config = sftp_config_from(strategy, params_map)?;
    // Pools are created lazily per fingerprint; block_in_place keeps the
    // factory interface synchronous.
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: "config_name".to_owned(),
            reason: "sftp strategies must be created inside the async runtime".to_owned(),
        }
    })?;
    tokio::task::block_in_place(|| {
        handle
            .block_on(manager.pool_for(&config))
            .map_err(|e| StrategyError::InvalidArgument {
                strategy: strategy.to_owned(),
                field: "config_name".to_owned(),
                reason: e.to_string(),
            })
    })
}

/// Builds [`SftpBundleLoader`] instances.
pub struct SftpLoaderFactory {
    manager: Arc<SftpManager>,
}

const SFTP_LOADER_FIELDS: &[&str] = &[
    "meta_load_name",
    "filename_pattern",
    "config_name",
    "connect_timeout_secs",
    "rate_limit_requests_per_second",
    "max_retries",
    "base_dir",
];

impl StrategyFactory for SftpLoaderFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("sftp_loader", params_map, SFTP_LOADER_FIELDS)?;
        params::require_str("sftp_loader", params_map, "meta_load_name")?;
        sftp_config_from("sftp_loader", params_map)?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let meta_load_name = params::require_str("sftp_loader", params_map, "meta_load_name")?;
        let pattern = params::optional_str("sftp_loader", params_map, "filename_pattern")?
            .unwrap_or("*");
        let pool = pool_from("sftp_loader", &self.manager, params_map)?;
        Ok(StrategyInstance::Loader(Arc::new(SftpBundleLoader::new(
            pool,
            pattern,
            meta_load_name,
        ))))
    }
}

/// Builds [`DirectorySftpLocator`] instances.
pub struct SftpDirectoryLocatorFactory {
    manager: Arc<SftpManager>,
}

const DIRECTORY_LOCATOR_FIELDS: &[&str] = &[
    "id",
    "remote_dir",
    "filename_pattern",
    "filter",
    "max_files",
    "sort_oldest_first",
    "config_name",
    "connect_timeout_secs",
    "rate_limit_requests_per_second",
    "max_retries",
    "base_dir",
];

impl StrategyFactory for SftpDirectoryLocatorFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("sftp_directory_locator", params_map, DIRECTORY_LOCATOR_FIELDS)?;
        params::require_str("sftp_directory_locator", params_map, "id")?;
        params::require_str("sftp_directory_locator", params_map, "remote_dir")?;
        sftp_config_from("sftp_directory_locator", params_map)?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let id = params::require_str("sftp_directory_locator", params_map, "id")?;
        let remote_dir = params::require_str("sftp_directory_locator", params_map, "remote_dir")?;
        let pattern =
            params::optional_str("sftp_directory_locator", params_map, "filename_pattern")?
                .unwrap_or("*");
        let pool = pool_from("sftp_directory_locator", &self.manager, params_map)?;

        let mut locator = DirectorySftpLocator::new(id, pool, remote_dir, pattern);
        if let Some(filter) = params::optional_strategy(
            "sftp_directory_locator",
            params_map,
            "filter",
            StrategyKind::FileFilter,
            registry,
        )? {
            locator = locator.with_file_filter(filter.into_filter("filter")?);
        }
        if let Some(max_files) =
            params::optional_u64("sftp_directory_locator", params_map, "max_files")?
        {
            locator = locator.with_max_files(usize::try_from(max_files).unwrap_or(usize::MAX));
        }
        if params_map
            .get("sort_oldest_first")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            locator = locator.oldest_first();
        }
        Ok(StrategyInstance::Locator(Arc::new(locator)))
    }
}

/// Builds [`FileSftpLocator`] instances.
pub struct SftpFileLocatorFactory {
    manager: Arc<SftpManager>,
}

const FILE_LOCATOR_FIELDS: &[&str] = &[
    "id",
    "file_paths",
    "config_name",
    "connect_timeout_secs",
    "rate_limit_requests_per_second",
    "max_retries",
    "base_dir",
];

impl StrategyFactory for SftpFileLocatorFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("sftp_file_locator", params_map, FILE_LOCATOR_FIELDS)?;
        params::require_str("sftp_file_locator", params_map, "id")?;
        params::optional_str_list("sftp_file_locator", params_map, "file_paths")?.ok_or_else(
            || StrategyError::InvalidArgument {
                strategy: "sftp_file_locator".to_owned(),
                field: "file_paths".to_owned(),
                reason: "missing required field".to_owned(),
            },
        )?;
        sftp_config_from("sftp_file_locator", params_map)?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let id = params::require_str("sftp_file_locator", params_map, "id")?;
        let file_paths = params::optional_str_list("sftp_file_locator", params_map, "file_paths")?
            .unwrap_or_default();
        let pool = pool_from("sftp_file_locator", &self.manager, params_map)?;
        Ok(StrategyInstance::Locator(Arc::new(FileSftpLocator::new(
            id, pool, file_paths,
        ))))
    }
}
