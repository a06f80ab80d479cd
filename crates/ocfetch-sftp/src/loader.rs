//! SFTP bundle loader.
//!
//! Resolves the request path against the pool, then streams either the
//! single file or — for directories — every pattern-matching file into one
//! bundle, and completes it. Load failures consume the request and return
//! no bundle; the locator's dedup state leaves the item eligible for the
//! next run.

use std::sync::Arc;

use glob_match::glob_match;
use ocfetch_core::error::LoaderError;
use ocfetch_core::model::{
    BundleRef, FetchRunContext, FetcherRecipe, MetaMap, RequestMeta, ResourceMeta,
};
use ocfetch_core::storage::Storage;
use ocfetch_core::strategy::BundleLoader;
use tracing::{debug, warn};

use crate::pool::{SftpConnection, SftpConnectionPool};

/// Streams remote files into bundles.
pub struct SftpBundleLoader {
    pool: Arc<SftpConnectionPool>,
    filename_pattern: String,
    meta_load_name: String,
}

impl SftpBundleLoader {
    /// Create a loader over a shared pool. `filename_pattern` applies to
    /// directory loads only.
    #[must_use]
    pub fn new(
        pool: Arc<SftpConnectionPool>,
        filename_pattern: impl Into<String>,
        meta_load_name: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            filename_pattern: filename_pattern.into(),
            meta_load_name: meta_load_name.into(),
        }
    }

    fn remote_path(url: &str) -> &str {
        url.strip_prefix("sftp://").unwrap_or(url)
    }

    fn file_name(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    async fn load_file(
        &self,
        lease: &SftpConnection,
        context: &Arc<ocfetch_core::storage::BundleStorageContext>,
        path: &str,
        size: Option<u64>,
        mtime: Option<u64>,
    ) -> Result<(), LoaderError> {
        let stream = lease
            .open_read(path)
            .await
            .map_err(|e| e.into_loader_error(path))?;

        let mut meta = ResourceMeta::for_url(format!("sftp://{path}"));
        meta.content_type = Some("application/octet-stream".to_owned());
        if let Some(size) = size {
            meta.headers.insert("size".to_owned(), size.to_string());
        }
        if let Some(mtime) = mtime {
            meta.headers.insert("mtime".to_owned(), mtime.to_string());
        }

        context
            .add_resource(Self::file_name(path), meta, stream)
            .await
            .map_err(LoaderError::Storage)
    }

    async fn load_inner(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn Storage>,
        ctx: &Arc<FetchRunContext>,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>, LoaderError> {
        let path = Self::remote_path(&request.url).to_owned();
        let lease = self
            .pool
            .acquire(ctx.credentials())
            .await
            .map_err(|e| e.into_loader_error(&request.url))?;

        let result = self
            .load_with_lease(&lease, &path, request, storage, ctx, recipe)
            .await;
        lease.release().await;
        result
    }

    async fn load_with_lease(
        &self,
        lease: &SftpConnection,
        path: &str,
        request: &RequestMeta,
        storage: &Arc<dyn Storage>,
        ctx: &Arc<FetchRunContext>,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>, LoaderError> {
        let stat = lease
            .stat(path)
            .await
            .map_err(|e| e.into_loader_error(&request.url))?;

        let mut bundle = request
            .bundle()
            .unwrap_or_else(|_| BundleRef::new(request.url.clone()));
        if let Some(size) = stat.size {
            bundle.meta.insert("size".to_owned(), size.into());
        }
        if let Some(mtime) = stat.mtime {
            bundle.meta.insert("mtime".to_owned(), mtime.into());
        }

        let context = storage
            .start_bundle(bundle.clone(), Arc::clone(recipe), Arc::clone(ctx))
            .await
            .map_err(LoaderError::Storage)?;

        let mut resources = 0u32;
        if stat.is_dir {
            let entries = lease
                .list_dir(path)
                .await
                .map_err(|e| e.into_loader_error(&request.url))?;
            for entry in entries {
                if entry.stat.is_dir || !glob_match(&self.filename_pattern, &entry.name) {
                    continue;
                }
                let file_path = format!("{}/{}", path.trim_end_matches('/'), entry.name);
                self.load_file(lease, &context, &file_path, entry.stat.size, entry.stat.mtime)
                    .await?;
                resources += 1;
            }
        } else {
            self.load_file(lease, &context, path, stat.size, stat.mtime)
                .await?;
            resources = 1;
        }

        let mut metadata = MetaMap::new();
        metadata.insert("source".to_owned(), "sftp".into());
        metadata.insert("run_id".to_owned(), ctx.run_id.clone().into());
        metadata.insert("loader".to_owned(), self.meta_load_name.clone().into());
        metadata.insert("resources_count".to_owned(), resources.into());
        context.complete(metadata).await.map_err(LoaderError::Storage)?;

        debug!(
            url = %request.url,
            bid = %bundle.bid,
            resources,
            loader = %self.meta_load_name,
            "sftp bundle loaded"
        );
        Ok(vec![context.bundle().clone()])
    }
}

#[async_trait::async_trait]
impl BundleLoader for SftpBundleLoader {
    async fn load(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn Storage>,
        ctx: &Arc<FetchRunContext>,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>, LoaderError> {
        match self.load_inner(request, storage, ctx, recipe).await {
            Ok(bundles) => Ok(bundles),
            Err(err) => {
                warn!(
                    url = %request.url,
                    loader = %self.meta_load_name,
                    error = %err,
                    "sftp load failed"
                );
                Ok(Vec::new())
            }
        }
    }
}

impl std::fmt::Debug for SftpBundleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpBundleLoader")
            .field("meta_load_name", &self.meta_load_name)
            .field("filename_pattern", &self.filename_pattern)
            .finish_non_exhaustive()
    }
}
