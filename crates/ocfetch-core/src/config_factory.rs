//! Application configuration factory.
//!
//! Builds the injected collaborators — credential provider, key-value
//! store, storage sink — from CLI overrides and the `OC_*` environment.
//! Precedence everywhere: explicit setting, then component-specific
//! environment variable, then generic environment, then default.

use std::sync::Arc;

use tracing::info;

use crate::credentials::{create_credential_provider, CredentialSettings};
use crate::error::ConfigError;
use crate::model::AppConfig;
use crate::storage::{FileStorage, Storage};
use ocfetch_kv::{KeyValueStore, MemoryKvStore};

/// Which key-value store backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvStoreKind {
    /// In-memory (single-shot runs, tests).
    Memory,
    /// Redis (resumable runs).
    Redis,
}

impl KvStoreKind {
    /// Parse a store selector (`memory` or `redis`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownVariant`] for anything else.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::UnknownVariant {
                setting: "kv store type".to_owned(),
                value: other.to_owned(),
            }),
        }
    }
}

/// Which storage sink to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    /// Local filesystem sink.
    File,
    /// Object-store sink over the pipeline bus layout.
    S3,
}

impl StorageKind {
    /// Parse a storage selector (`file` or `s3`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownVariant`] for anything else.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "s3" => Ok(Self::S3),
            other => Err(ConfigError::UnknownVariant {
                setting: "storage type".to_owned(),
                value: other.to_owned(),
            }),
        }
    }
}

/// Overrides from the CLI. Unset fields fall back to `OC_*` environment
/// variables and then to defaults.
#[derive(Debug, Clone, Default)]
pub struct AppConfigSettings {
    /// Credential backend settings.
    pub credentials: CredentialSettings,
    /// `memory` or `redis`. Env: `OC_KV_STORE_TYPE` (default `redis`).
    pub kv_store_type: Option<String>,
    /// Redis host. Env: `OC_KV_STORE_REDIS_HOST` (default `localhost`).
    pub redis_host: Option<String>,
    /// Redis port. Env: `OC_KV_STORE_REDIS_PORT` (default `6379`).
    pub redis_port: Option<u16>,
    /// Redis database. Env: `OC_KV_STORE_REDIS_DB` (default `0`).
    pub redis_db: Option<i64>,
    /// Redis password. Env: `OC_KV_STORE_REDIS_PASSWORD`.
    pub redis_password: Option<String>,
    /// Redis key prefix. Env: `OC_KV_STORE_REDIS_PREFIX` (default `ocfetch:`).
    pub redis_key_prefix: Option<String>,
    /// `file` or `s3`. Env: `OC_STORAGE_TYPE` (default `s3`).
    pub storage_type: Option<String>,
    /// S3 bucket. Env: `OC_STORAGE_S3_BUCKET` (required for `s3`).
    pub s3_bucket: Option<String>,
    /// S3 key prefix. Env: `OC_STORAGE_S3_PREFIX` (default empty).
    pub s3_prefix: Option<String>,
    /// S3 region. Env: `OC_STORAGE_S3_REGION`, then `AWS_REGION`
    /// (default `eu-west-2`).
    pub s3_region: Option<String>,
    /// S3 endpoint override. Env: `OC_STORAGE_S3_ENDPOINT_URL`.
    pub s3_endpoint_url: Option<String>,
    /// File sink root. Env: `OC_STORAGE_FILE_PATH`
    /// (default `tmp/file_storage`).
    pub file_path: Option<String>,
    /// Gzip-unwrap decorator. Env: `OC_STORAGE_USE_UNZIP` (default `true`).
    pub use_unzip: Option<bool>,
    /// Archive-bundling decorator. Env: `OC_STORAGE_USE_BUNDLER`
    /// (default `false`).
    pub use_bundler: Option<bool>,
    /// Completion notification queue. Env: `OC_SQS_QUEUE_URL`.
    pub sqs_queue_url: Option<String>,
    /// Registry id used in the object-store key layout.
    /// Env: `OC_CONFIG_ID` (defaults to the recipe id at run time).
    pub registry_id: Option<String>,
}

fn setting(value: Option<String>, var: &str) -> Option<String> {
    value.or_else(|| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

fn bool_setting(value: Option<bool>, var: &str, default: bool) -> bool {
    value.unwrap_or_else(|| {
        std::env::var(var)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(default)
    })
}

/// Build the key-value store.
///
/// # Errors
///
/// Returns [`ConfigError`] for unknown store types, bad Redis settings, or
/// a Redis backend requested without the `redis-backend` feature.
pub async fn create_kv_store(
    settings: &AppConfigSettings,
) -> Result<Arc<dyn KeyValueStore>, ConfigError> {
    let store_type = setting(settings.kv_store_type.clone(), "OC_KV_STORE_TYPE")
        .unwrap_or_else(|| "redis".to_owned());

    match KvStoreKind::parse(&store_type)? {
        KvStoreKind::Memory => {
            info!("using in-memory kv store (state will not survive restarts)");
            Ok(Arc::new(MemoryKvStore::new()))
        }
        #[cfg(feature = "redis-backend")]
        KvStoreKind::Redis => {
            let mut redis = ocfetch_kv::RedisSettings::default();
            if let Some(host) = setting(settings.redis_host.clone(), "OC_KV_STORE_REDIS_HOST") {
                redis.host = host;
            }
            if let Some(port) = settings.redis_port {
                redis.port = port;
            } else if let Some(port) = setting(None, "OC_KV_STORE_REDIS_PORT") {
                redis.port = port.parse().map_err(|_| ConfigError::Invalid {
                    name: "OC_KV_STORE_REDIS_PORT".to_owned(),
                    reason: format!("not a port number: '{port}'"),
                })?;
            }
            if let Some(db) = settings.redis_db {
                redis.db = db;
            } else if let Some(db) = setting(None, "OC_KV_STORE_REDIS_DB") {
                redis.db = db.parse().map_err(|_| ConfigError::Invalid {
                    name: "OC_KV_STORE_REDIS_DB".to_owned(),
                    reason: format!("not a database number: '{db}'"),
                })?;
            }
            redis.password = setting(
                settings.redis_password.clone(),
                "OC_KV_STORE_REDIS_PASSWORD",
            );
            if let Some(prefix) =
                setting(settings.redis_key_prefix.clone(), "OC_KV_STORE_REDIS_PREFIX")
            {
                redis.key_prefix = prefix;
            }

            info!(host = %redis.host, port = redis.port, db = redis.db, "using redis kv store");
            let store = ocfetch_kv::RedisKvStore::connect(&redis)
                .await
                .map_err(|e| ConfigError::Invalid {
                    name: "kv store".to_owned(),
                    reason: e.to_string(),
                })?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-backend"))]
        KvStoreKind::Redis => Err(ConfigError::Invalid {
            name: "kv store type".to_owned(),
            reason: "this build does not include the 'redis-backend' feature".to_owned(),
        }),
    }
}

/// Build the storage sink (and its notification publisher).
///
/// # Errors
///
/// Returns [`ConfigError`] for unknown storage types, a missing bucket or
/// queue URL for the object-store sink, or an `s3` request in a build
/// without the `aws` feature.
pub async fn create_storage(
    settings: &AppConfigSettings,
) -> Result<Arc<dyn Storage>, ConfigError> {
    let storage_type = setting(settings.storage_type.clone(), "OC_STORAGE_TYPE")
        .unwrap_or_else(|| "s3".to_owned());
    let use_unzip = bool_setting(settings.use_unzip, "OC_STORAGE_USE_UNZIP", true);
    let use_bundler = bool_setting(settings.use_bundler, "OC_STORAGE_USE_BUNDLER", false);

    match StorageKind::parse(&storage_type)? {
        StorageKind::File => {
            let root = setting(settings.file_path.clone(), "OC_STORAGE_FILE_PATH")
                .unwrap_or_else(|| "tmp/file_storage".to_owned());
            info!(path = %root, "using filesystem storage");
            let mut builder = FileStorage::builder(&root)
                .unwrap_gzip(use_unzip)
                .bundle_archive(use_bundler);
            #[cfg(feature = "aws")]
            if let Some(queue_url) = setting(settings.sqs_queue_url.clone(), "OC_SQS_QUEUE_URL") {
                let region = aws_region(settings);
                let publisher = crate::notify::SqsNotificationPublisher::connect(
                    Some(queue_url),
                    &region,
                    None,
                )
                .await
                .map_err(|e| ConfigError::Invalid {
                    name: "OC_SQS_QUEUE_URL".to_owned(),
                    reason: e.to_string(),
                })?;
                builder = builder.publisher(Arc::new(publisher));
            }
            let storage = builder.build().map_err(|e| ConfigError::Invalid {
                name: "OC_STORAGE_FILE_PATH".to_owned(),
                reason: e.to_string(),
            })?;
            Ok(Arc::new(storage))
        }
        #[cfg(feature = "aws")]
        StorageKind::S3 => {
            let bucket = setting(settings.s3_bucket.clone(), "OC_STORAGE_S3_BUCKET")
                .ok_or_else(|| ConfigError::Missing {
                    name: "OC_STORAGE_S3_BUCKET".to_owned(),
                })?;
            let region = aws_region(settings);
            let queue_url = setting(settings.sqs_queue_url.clone(), "OC_SQS_QUEUE_URL");
            // The object-store sink must announce completions.
            let publisher =
                crate::notify::SqsNotificationPublisher::connect(queue_url, &region, None)
                    .await
                    .map_err(|_| ConfigError::Missing {
                        name: "OC_SQS_QUEUE_URL".to_owned(),
                    })?;

            let pipeline = crate::storage::PipelineBusSettings {
                bucket: bucket.clone(),
                prefix: setting(settings.s3_prefix.clone(), "OC_STORAGE_S3_PREFIX")
                    .unwrap_or_default(),
                registry_id: setting(settings.registry_id.clone(), "OC_CONFIG_ID")
                    .unwrap_or_else(|| "default".to_owned()),
                region,
                endpoint_url: setting(
                    settings.s3_endpoint_url.clone(),
                    "OC_STORAGE_S3_ENDPOINT_URL",
                ),
            };
            info!(bucket = %bucket, registry_id = %pipeline.registry_id, "using pipeline bus storage");
            let storage = crate::storage::PipelineBusStorage::connect(
                pipeline,
                Arc::new(publisher),
                use_unzip,
                use_bundler,
            )
            .await;
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "aws"))]
        StorageKind::S3 => Err(ConfigError::Invalid {
            name: "storage type".to_owned(),
            reason: "this build does not include the 'aws' feature".to_owned(),
        }),
    }
}

#[cfg(feature = "aws")]
fn aws_region(settings: &AppConfigSettings) -> String {
    setting(settings.s3_region.clone(), "OC_STORAGE_S3_REGION")
        .or_else(|| std::env::var("AWS_REGION").ok())
        .unwrap_or_else(|| "eu-west-2".to_owned())
}

/// Build the full application configuration.
///
/// # Errors
///
/// Returns [`ConfigError`] when any collaborator cannot be built.
pub async fn create_app_config(
    settings: &AppConfigSettings,
) -> Result<Arc<AppConfig>, ConfigError> {
    let credential_provider = create_credential_provider(&settings.credentials).await?;
    let kv_store = create_kv_store(settings).await?;
    let storage = create_storage(settings).await?;
    Ok(Arc::new(AppConfig {
        credential_provider,
        kv_store,
        storage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_parse() {
        assert_eq!(KvStoreKind::parse("Memory").unwrap(), KvStoreKind::Memory);
        assert_eq!(KvStoreKind::parse("redis").unwrap(), KvStoreKind::Redis);
        assert!(KvStoreKind::parse("sqlite").is_err());

        assert_eq!(StorageKind::parse("file").unwrap(), StorageKind::File);
        assert_eq!(StorageKind::parse("S3").unwrap(), StorageKind::S3);
        assert!(StorageKind::parse("gcs").is_err());
    }

    #[tokio::test]
    async fn memory_store_and_file_storage_build_without_features() {
        let settings = AppConfigSettings {
            kv_store_type: Some("memory".to_owned()),
            storage_type: Some("file".to_owned()),
            file_path: Some(
                tempfile::tempdir()
                    .unwrap()
                    .path()
                    .to_string_lossy()
                    .into_owned(),
            ),
            use_unzip: Some(false),
            use_bundler: Some(false),
            ..AppConfigSettings::default()
        };

        assert!(create_kv_store(&settings).await.is_ok());
        assert!(create_storage(&settings).await.is_ok());
    }

    #[tokio::test]
    async fn explicit_setting_beats_environment() {
        std::env::set_var("OC_KV_STORE_TYPE", "redis");
        let settings = AppConfigSettings {
            kv_store_type: Some("memory".to_owned()),
            ..AppConfigSettings::default()
        };
        // The explicit `memory` wins over the env `redis`.
        assert!(create_kv_store(&settings).await.is_ok());
        std::env::remove_var("OC_KV_STORE_TYPE");
    }
}
