//! Filesystem storage sink.
//!
//! Layout: one `bundle_<BID>/` directory per bundle under the root, each
//! resource written as a file with a `<file>.meta` JSON sidecar, and a
//! bundle-level `bundle.meta` written at completion. The default sink for
//! local runs and tests.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, MetaMap, ResourceMeta};
use crate::notify::NotificationPublisher;
use crate::storage::{
    ArchiveBundleSink, BundleStorageContext, CompletedResource, GzipUnwrapSink, ResourceSink,
    ResourceStream, Storage,
};

/// Filesystem-backed [`Storage`].
pub struct FileStorage {
    sink: Arc<dyn ResourceSink>,
    publisher: Option<Arc<dyn NotificationPublisher>>,
}

impl FileStorage {
    /// Start building a `FileStorage` rooted at `root`.
    #[must_use]
    pub fn builder(root: impl Into<PathBuf>) -> FileStorageBuilder {
        FileStorageBuilder {
            root: root.into(),
            unwrap_gzip: false,
            bundle_archive: false,
            publisher: None,
        }
    }
}

/// Builder selecting the decorator chain and notification publisher.
pub struct FileStorageBuilder {
    root: PathBuf,
    unwrap_gzip: bool,
    bundle_archive: bool,
    publisher: Option<Arc<dyn NotificationPublisher>>,
}

impl FileStorageBuilder {
    /// Transparently decompress gzipped resources on write.
    #[must_use]
    pub fn unwrap_gzip(mut self, enabled: bool) -> Self {
        self.unwrap_gzip = enabled;
        self
    }

    /// Collect each bundle's resources into a single zip at completion.
    #[must_use]
    pub fn bundle_archive(mut self, enabled: bool) -> Self {
        self.bundle_archive = enabled;
        self
    }

    /// Publish completion notifications (optional for the file sink).
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn NotificationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Build the storage, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the root cannot be created.
    pub fn build(self) -> Result<FileStorage, StorageError> {
        std::fs::create_dir_all(&self.root)?;
        let mut sink: Arc<dyn ResourceSink> = Arc::new(FileSink { root: self.root });
        // Archive wraps outermost so it sees decompressed bytes.
        if self.unwrap_gzip {
            sink = Arc::new(GzipUnwrapSink::new(sink));
        }
        if self.bundle_archive {
            sink = Arc::new(ArchiveBundleSink::new(sink));
        }
        Ok(FileStorage {
            sink,
            publisher: self.publisher,
        })
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
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
        debug!(bid = %bundle.bid, recipe_id = %recipe.recipe_id, "bundle opened");
        Ok(Arc::new(BundleStorageContext::new(
            bundle,
            recipe,
            ctx,
            Arc::clone(&self.sink),
            self.publisher.clone(),
        )))
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage").finish_non_exhaustive()
    }
}

/// The base filesystem sink.
struct FileSink {
    root: PathBuf,
}

impl FileSink {
    fn bundle_dir(&self, bundle: &BundleRef) -> PathBuf {
        self.root.join(format!("bundle_{}", bundle.bid))
    }

    /// Flatten a resource name into a safe single-level file name.
    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                other => other,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ResourceSink for FileSink {
    async fn open_bundle(&self, bundle: &BundleRef) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.bundle_dir(bundle)).await?;
        Ok(())
    }

    async fn write_resource(
        &self,
        bundle: &BundleRef,
        name: &str,
        meta: &ResourceMeta,
        mut stream: ResourceStream,
    ) -> Result<(), StorageError> {
        let dir = self.bundle_dir(bundle);
        let file_name = Self::sanitize(name);

        let mut file = tokio::fs::File::create(dir.join(&file_name)).await?;
        tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;

        let sidecar = serde_json::to_vec_pretty(meta).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        tokio::fs::write(dir.join(format!("{file_name}.meta")), sidecar).await?;
        Ok(())
    }

    async fn complete_bundle(
        &self,
        bundle: &BundleRef,
        resources: &[CompletedResource],
        metadata: &MetaMap,
    ) -> Result<Option<String>, StorageError> {
        let dir = self.bundle_dir(bundle);
        let names: Vec<String> = resources.iter().map(|r| Self::sanitize(&r.name)).collect();

        let bundle_meta = serde_json::json!({
            "bid": bundle.bid.to_string(),
            "primary_url": bundle.primary_url,
            "resources_count": resources.len(),
            "resources": names,
            "completed_at": chrono::Utc::now().to_rfc3339(),
            "metadata": metadata,
        });
        let bytes =
            serde_json::to_vec_pretty(&bundle_meta).map_err(|e| StorageError::Serialization {
                reason: e.to_string(),
            })?;
        tokio::fs::write(dir.join("bundle.meta"), bytes).await?;

        Ok(Some(dir.to_string_lossy().into_owned()))
    }
}

/// Derive a resource file name from a URL: last path segment, or a short
/// hash when the URL has no usable name.
#[must_use]
pub fn resource_name_for_url(url: &str) -> String {
    let path = url
        .split(['#', '?'])
        .next()
        .unwrap_or(url);
    let candidate = path.rsplit('/').next().unwrap_or("");
    if candidate.is_empty() || candidate.contains(':') {
        use sha2::Digest;
        let digest = sha2::Sha256::digest(url.as_bytes());
        format!("resource_{}", &hex::encode(digest)[..8])
    } else {
        candidate.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::EnvCredentialProvider;
    use crate::error::LoaderError;
    use crate::model::{AppConfig, RequestMeta};
    use crate::strategy::BundleLoader;
    use ocfetch_kv::MemoryKvStore;

    struct NoopLoader;

    #[async_trait::async_trait]
    impl BundleLoader for NoopLoader {
        async fn load(
            &self,
            _request: &RequestMeta,
            _storage: &Arc<dyn Storage>,
            _ctx: &Arc<FetchRunContext>,
            _recipe: &Arc<FetcherRecipe>,
        ) -> Result<Vec<BundleRef>, LoaderError> {
            Ok(Vec::new())
        }
    }

    fn recipe() -> Arc<FetcherRecipe> {
        Arc::new(
            FetcherRecipe::builder("file-test")
                .loader(Arc::new(NoopLoader))
                .build()
                .unwrap(),
        )
    }

    fn run_context(storage: Arc<dyn Storage>) -> Arc<FetchRunContext> {
        let app_config = Arc::new(AppConfig {
            credential_provider: Arc::new(EnvCredentialProvider::new("OCT_FS_")),
            kv_store: Arc::new(MemoryKvStore::new()),
            storage,
        });
        Arc::new(FetchRunContext::new("run-file", app_config))
    }

    #[tokio::test]
    async fn writes_layout_with_sidecars_and_bundle_meta() {
        let root = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::builder(root.path()).build().unwrap());
        let ctx = run_context(Arc::clone(&storage));

        let bundle = BundleRef::new("https://example.com/data.csv");
        let bid = bundle.bid;
        let context = storage
            .start_bundle(bundle, recipe(), Arc::clone(&ctx))
            .await
            .unwrap();

        let mut meta = ResourceMeta::for_url("https://example.com/data.csv");
        meta.status = Some(200);
        meta.content_type = Some("text/csv".to_owned());
        context
            .add_resource("data.csv", meta, Box::new(&b"a,b\n1,2\n"[..]))
            .await
            .unwrap();

        let mut completion = MetaMap::new();
        completion.insert("source".to_owned(), serde_json::json!("http_api"));
        context.complete(completion).await.unwrap();

        let dir = root.path().join(format!("bundle_{bid}"));
        assert_eq!(
            std::fs::read(dir.join("data.csv")).unwrap(),
            b"a,b\n1,2\n".to_vec()
        );

        let sidecar: ResourceMeta =
            serde_json::from_slice(&std::fs::read(dir.join("data.csv.meta")).unwrap()).unwrap();
        assert_eq!(sidecar.status, Some(200));
        assert_eq!(sidecar.content_type.as_deref(), Some("text/csv"));

        let bundle_meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("bundle.meta")).unwrap()).unwrap();
        assert_eq!(bundle_meta["bid"], bid.to_string());
        assert_eq!(bundle_meta["resources_count"], 1);
        assert_eq!(bundle_meta["metadata"]["source"], "http_api");
    }

    #[tokio::test]
    async fn resource_names_are_sanitized() {
        let root = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::builder(root.path()).build().unwrap());
        let ctx = run_context(Arc::clone(&storage));

        let bundle = BundleRef::new("https://example.com/a");
        let bid = bundle.bid;
        let context = storage
            .start_bundle(bundle, recipe(), Arc::clone(&ctx))
            .await
            .unwrap();

        context
            .add_resource(
                "nested/path:file.txt",
                ResourceMeta::for_url("https://example.com/a"),
                Box::new(&b"x"[..]),
            )
            .await
            .unwrap();
        context.complete(MetaMap::new()).await.unwrap();

        let dir = root.path().join(format!("bundle_{bid}"));
        assert!(dir.join("nested_path_file.txt").exists());
    }

    #[test]
    fn resource_name_from_url() {
        assert_eq!(
            resource_name_for_url("https://example.com/files/data.csv?sig=1"),
            "data.csv"
        );
        assert!(resource_name_for_url("https://example.com/").starts_with("resource_"));
    }
}
