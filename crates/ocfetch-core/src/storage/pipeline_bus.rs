//! Object-store sink over the pipeline bus layout.
//!
//! Bundles land in S3 under
//! `raw/<registry_id>/data/year=YYYY/month=MM/day=DD/<time>-<rand>/` with a
//! `metadata/` tree (`_discovered.json`, per-resource metadata,
//! `_manifest.jsonl`, `_completed.json`) and a `content/` tree holding the
//! resource bytes. A content-addressed marker under
//! `raw/<registry_id>/bundle_hashes/` plus a `_latest` pointer give
//! downstream CDC a cheap change signal. Completion notifications are
//! mandatory for this sink — construction fails without a publisher.

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_s3::primitives::ByteStream;
use sha2::Digest;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, MetaMap, ResourceMeta};
use crate::notify::NotificationPublisher;
use crate::storage::{
    BundleStorageContext, CompletedResource, ResourceSink, ResourceStream, Storage,
};

/// Settings for [`PipelineBusStorage`].
#[derive(Debug, Clone)]
pub struct PipelineBusSettings {
    /// Target bucket.
    pub bucket: String,
    /// Key prefix in front of `raw/` (may be empty).
    pub prefix: String,
    /// Registry identifier used in the key layout.
    pub registry_id: String,
    /// AWS region.
    pub region: String,
    /// Endpoint override for localstack testing.
    pub endpoint_url: Option<String>,
}

/// S3-backed [`Storage`] using the pipeline bus layout.
pub struct PipelineBusStorage {
    sink: Arc<dyn ResourceSink>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl PipelineBusStorage {
    /// Connect to S3. The publisher is required: the object-store sink must
    /// announce every completed bundle. `unwrap_gzip` and `bundle_archive`
    /// select the decorator chain in front of the object store.
    pub async fn connect(
        settings: PipelineBusSettings,
        publisher: Arc<dyn NotificationPublisher>,
        unwrap_gzip: bool,
        bundle_archive: bool,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        let mut sink: Arc<dyn ResourceSink> = Arc::new(PipelineBusSink {
            s3: aws_sdk_s3::Client::new(&config),
            settings,
            active: Mutex::new(HashMap::new()),
        });
        if unwrap_gzip {
            sink = Arc::new(crate::storage::GzipUnwrapSink::new(sink));
        }
        if bundle_archive {
            sink = Arc::new(crate::storage::ArchiveBundleSink::new(sink));
        }
        Self { sink, publisher }
    }
}

#[async_trait::async_trait]
impl Storage for PipelineBusStorage {
    async fn start_bundle(
        &self,
        bundle: BundleRef,
        recipe: Arc<FetcherRecipe>,
        ctx: Arc<FetchRunContext>,
    ) -> Result<Arc<BundleStorageContext>, StorageError> {
        bundle
            .validate()
            .map_err(|e| StorageError::Sink { reason: e.to_string() })?;
        self.sink.open_bundle(&bundle).await?;
        Ok(Arc::new(BundleStorageContext::new(
            bundle,
            recipe,
            ctx,
            Arc::clone(&self.sink),
            Some(Arc::clone(&self.publisher)),
        )))
    }
}

impl std::fmt::Debug for PipelineBusStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBusStorage").finish_non_exhaustive()
    }
}

struct PipelineBusSink {
    s3: aws_sdk_s3::Client,
    settings: PipelineBusSettings,
    /// bid -> base key for every open bundle.
    active: Mutex<HashMap<String, String>>,
}

impl PipelineBusSink {
    /// Compute the partitioned base key for a bundle opened now. The key
    /// partitions by discovery date; the bundle's own timestamp lives in
    /// its BID.
    fn base_key(&self) -> String {
        let now = chrono::Utc::now();
        let rand8 = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let prefix = if self.settings.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.settings.prefix.trim_end_matches('/'))
        };
        format!(
            "{prefix}raw/{registry}/data/year={year}/month={month}/day={day}/{time}-{rand8}",
            registry = self.settings.registry_id,
            year = now.format("%Y"),
            month = now.format("%m"),
            day = now.format("%d"),
            time = now.format("%H%M%S"),
        )
    }

    async fn bundle_base(&self, bundle: &BundleRef) -> Result<String, StorageError> {
        let active = self.active.lock().await;
        active
            .get(&bundle.bid.to_string())
            .cloned()
            .ok_or_else(|| StorageError::BundleNotOpen {
                bid: bundle.bid.to_string(),
            })
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.s3
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Sink {
                reason: format!("put '{key}' failed: {e}"),
            })?;
        Ok(())
    }

    async fn put_json(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        self.put_bytes(key, bytes).await
    }

    fn hash_prefix(&self) -> String {
        let prefix = if self.settings.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.settings.prefix.trim_end_matches('/'))
        };
        format!("{prefix}raw/{}/bundle_hashes", self.settings.registry_id)
    }
}

#[async_trait::async_trait]
impl ResourceSink for PipelineBusSink {
    async fn open_bundle(&self, bundle: &BundleRef) -> Result<(), StorageError> {
        let base = self.base_key();
        {
            let mut active = self.active.lock().await;
            active.insert(bundle.bid.to_string(), base.clone());
        }

        let discovered = serde_json::json!({
            "bid": bundle.bid.to_string(),
            "primary_url": bundle.primary_url,
            "resources_count": bundle.resources_count,
            "meta": bundle.meta,
            "discovered_at": chrono::Utc::now().to_rfc3339(),
        });
        self.put_json(&format!("{base}/metadata/_discovered.json"), &discovered)
            .await?;
        debug!(bid = %bundle.bid, key = %base, "bundle discovered in pipeline bus");
        Ok(())
    }

    async fn write_resource(
        &self,
        bundle: &BundleRef,
        name: &str,
        meta: &ResourceMeta,
        mut stream: ResourceStream,
    ) -> Result<(), StorageError> {
        let base = self.bundle_base(bundle).await?;

        // Buffer through a temp file: S3 wants a known length and the
        // source stream does not carry one.
        let staged = tokio::task::spawn_blocking(tempfile::NamedTempFile::new)
            .await
            .map_err(|e| StorageError::Sink {
                reason: format!("staging task failed: {e}"),
            })??
            .into_temp_path();
        let mut file = tokio::fs::File::create(&staged).await?;
        tokio::io::copy(&mut stream, &mut file).await?;
        file.sync_all().await?;

        let body = ByteStream::from_path(&staged)
            .await
            .map_err(|e| StorageError::Sink {
                reason: format!("staged body unreadable: {e}"),
            })?;
        self.s3
            .put_object()
            .bucket(&self.settings.bucket)
            .key(format!("{base}/content/{name}"))
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Sink {
                reason: format!("put resource '{name}' failed: {e}"),
            })?;

        let meta_json = serde_json::to_value(meta).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        self.put_json(&format!("{base}/metadata/{name}.metadata.json"), &meta_json)
            .await?;
        Ok(())
    }

    async fn complete_bundle(
        &self,
        bundle: &BundleRef,
        resources: &[CompletedResource],
        metadata: &MetaMap,
    ) -> Result<Option<String>, StorageError> {
        let base = self.bundle_base(bundle).await?;

        // Manifest: one JSON line per stored resource.
        let mut manifest = String::new();
        for resource in resources {
            let line = serde_json::json!({
                "name": resource.name,
                "url": resource.meta.url,
                "status": resource.meta.status,
                "content_type": resource.meta.content_type,
            });
            manifest.push_str(&line.to_string());
            manifest.push('\n');
        }
        self.put_bytes(&format!("{base}/metadata/_manifest.jsonl"), manifest.into_bytes())
            .await?;

        let completed = serde_json::json!({
            "bid": bundle.bid.to_string(),
            "primary_url": bundle.primary_url,
            "resources_count": resources.len(),
            "completed_at": chrono::Utc::now().to_rfc3339(),
            "metadata": metadata,
        });
        self.put_json(&format!("{base}/metadata/_completed.json"), &completed)
            .await?;

        // CDC markers: a content hash of the primary URL pointing at this
        // bundle, and a `_latest` pointer for cheap change detection.
        let hash = hex::encode(sha2::Sha256::digest(bundle.primary_url.as_bytes()));
        let marker = serde_json::json!({
            "bid": bundle.bid.to_string(),
            "storage_key": base,
        });
        self.put_json(&format!("{}/{hash}", self.hash_prefix()), &marker)
            .await?;
        self.put_json(&format!("{}/{hash}_latest", self.hash_prefix()), &marker)
            .await?;

        {
            let mut active = self.active.lock().await;
            active.remove(&bundle.bid.to_string());
        }

        debug!(bid = %bundle.bid, key = %base, "bundle completed in pipeline bus");
        Ok(Some(base))
    }
}
