//! SFTP bundle locators.
//!
//! The directory locator enumerates a remote directory against a
//! shell-style pattern and an optional filter, newest first by default;
//! the file locator walks a fixed path list. Both dedup by remembering
//! `filename -> mtime` under `locator:<id>:processed:` and re-emit when
//! the remote mtime advances, which is what makes interrupted runs
//! resumable without re-downloading finished files.

use std::sync::Arc;

use glob_match::glob_match;
use ocfetch_core::error::LocatorError;
use ocfetch_core::model::{BundleRef, FetchRunContext, MetaMap};
use ocfetch_core::strategy::{BundleLocator, EmissionGuard, FileFilter};
use tracing::{debug, info};

use crate::pool::SftpConnectionPool;
use crate::session::SftpDirEntry;

async fn processed_mtime(
    ctx: &FetchRunContext,
    locator_id: &str,
    name: &str,
) -> Result<Option<u64>, LocatorError> {
    let key = format!("locator:{locator_id}:processed:{name}");
    match ctx.kv().get(&key).await? {
        Some(bytes) => Ok(String::from_utf8_lossy(&bytes).parse().ok()),
        None => Ok(None),
    }
}

async fn record_processed(
    ctx: &FetchRunContext,
    locator_id: &str,
    name: &str,
    mtime: u64,
) -> Result<(), LocatorError> {
    let key = format!("locator:{locator_id}:processed:{name}");
    ctx.kv().put(&key, mtime.to_string().as_bytes(), None).await?;
    Ok(())
}

fn bundle_for_file(
    locator_id: &str,
    remote_dir: &str,
    name: &str,
    mtime: Option<u64>,
    size: Option<u64>,
) -> BundleRef {
    let path = if remote_dir.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", remote_dir.trim_end_matches('/'), name)
    };
    let mut meta = MetaMap::new();
    meta.insert("locator_id".to_owned(), locator_id.to_owned().into());
    meta.insert("filename".to_owned(), name.to_owned().into());
    if let Some(mtime) = mtime {
        meta.insert("mtime".to_owned(), mtime.into());
    }
    if let Some(size) = size {
        meta.insert("size".to_owned(), size.into());
    }
    BundleRef::new(format!("sftp://{path}")).with_meta(meta)
}

fn owned_bundle_file(locator_id: &str, bundle: &BundleRef) -> Option<(String, u64)> {
    if bundle.meta.get("locator_id").and_then(serde_json::Value::as_str) != Some(locator_id) {
        return None;
    }
    let name = bundle.meta.get("filename").and_then(serde_json::Value::as_str)?;
    let mtime = bundle
        .meta
        .get("mtime")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    Some((name.to_owned(), mtime))
}

/// Enumerates a remote directory, one bundle per matching file.
pub struct DirectorySftpLocator {
    id: String,
    pool: Arc<SftpConnectionPool>,
    remote_dir: String,
    filename_pattern: String,
    max_files: Option<usize>,
    file_filter: Option<Arc<dyn FileFilter>>,
    /// Newest first when `true` (the default).
    sort_desc: bool,
}

impl DirectorySftpLocator {
    /// Create a directory locator.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        pool: Arc<SftpConnectionPool>,
        remote_dir: impl Into<String>,
        filename_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pool,
            remote_dir: remote_dir.into(),
            filename_pattern: filename_pattern.into(),
            max_files: None,
            file_filter: None,
            sort_desc: true,
        }
    }

    /// Cap the number of files considered per poll.
    #[must_use]
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }

    /// Filter candidate file names.
    #[must_use]
    pub fn with_file_filter(mut self, filter: Arc<dyn FileFilter>) -> Self {
        self.file_filter = Some(filter);
        self
    }

    /// Sort oldest first instead of newest first.
    #[must_use]
    pub fn oldest_first(mut self) -> Self {
        self.sort_desc = false;
        self
    }

    fn matches(&self, entry: &SftpDirEntry) -> bool {
        if entry.stat.is_dir {
            return false;
        }
        if !glob_match(&self.filename_pattern, &entry.name) {
            return false;
        }
        match &self.file_filter {
            Some(filter) => filter.accept(&entry.name),
            None => true,
        }
    }
}

#[async_trait::async_trait]
impl BundleLocator for DirectorySftpLocator {
    fn locator_id(&self) -> &str {
        &self.id
    }

    async fn next_bundle_refs(
        &self,
        ctx: &FetchRunContext,
        needed: usize,
    ) -> Result<Vec<BundleRef>, LocatorError> {
        let lease = self
            .pool
            .acquire(ctx.credentials())
            .await
            .map_err(|e| e.into_locator_stall(&self.id))?;

        let listing = lease.list_dir(&self.remote_dir).await;
        lease.release().await;
        let mut entries: Vec<SftpDirEntry> = listing
            .map_err(|e| e.into_locator_stall(&self.id))?
            .into_iter()
            .filter(|entry| self.matches(entry))
            .collect();

        entries.sort_by_key(|entry| entry.stat.mtime.unwrap_or(0));
        if self.sort_desc {
            entries.reverse();
        }
        if let Some(max_files) = self.max_files {
            entries.truncate(max_files);
        }

        let mut bundles = Vec::new();
        for entry in entries {
            if bundles.len() >= needed {
                break;
            }
            let mtime = entry.stat.mtime.unwrap_or(0);
            // Skip files already processed at this (or a newer) mtime;
            // a file rewritten remotely comes back with a larger mtime
            // and is emitted again.
            if let Some(seen) = processed_mtime(ctx, &self.id, &entry.name).await? {
                if seen >= mtime {
                    continue;
                }
            }
            let item_key = format!("{}@{mtime}", entry.name);
            if EmissionGuard::already_emitted(ctx, &self.id, &item_key).await? {
                continue;
            }

            EmissionGuard::mark_emitted(ctx, &self.id, &item_key).await?;
            info!(locator_id = %self.id, file = %entry.name, mtime, "file emitted");
            bundles.push(bundle_for_file(
                &self.id,
                &self.remote_dir,
                &entry.name,
                entry.stat.mtime,
                entry.stat.size,
            ));
        }
        Ok(bundles)
    }

    async fn on_bundle_complete(
        &self,
        ctx: &FetchRunContext,
        bundle: &BundleRef,
    ) -> Result<(), LocatorError> {
        if let Some((name, mtime)) = owned_bundle_file(&self.id, bundle) {
            record_processed(ctx, &self.id, &name, mtime).await?;
            debug!(locator_id = %self.id, file = %name, mtime, "file checkpointed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for DirectorySftpLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorySftpLocator")
            .field("id", &self.id)
            .field("remote_dir", &self.remote_dir)
            .field("filename_pattern", &self.filename_pattern)
            .finish_non_exhaustive()
    }
}

/// Emits bundles for a fixed list of remote paths, re-emitting a path when
/// its remote mtime advances (quarterly drops replace the same file name).
pub struct FileSftpLocator {
    id: String,
    pool: Arc<SftpConnectionPool>,
    file_paths: Vec<String>,
}

impl FileSftpLocator {
    /// Create a file locator.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        pool: Arc<SftpConnectionPool>,
        file_paths: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pool,
            file_paths,
        }
    }
}

#[async_trait::async_trait]
impl BundleLocator for FileSftpLocator {
    fn locator_id(&self) -> &str {
        &self.id
    }

    async fn next_bundle_refs(
        &self,
        ctx: &FetchRunContext,
        needed: usize,
    ) -> Result<Vec<BundleRef>, LocatorError> {
        let lease = self
            .pool
            .acquire(ctx.credentials())
            .await
            .map_err(|e| e.into_locator_stall(&self.id))?;

        let mut bundles = Vec::new();
        for path in &self.file_paths {
            if bundles.len() >= needed {
                break;
            }
            let stat = match lease.stat(path).await {
                Ok(stat) if stat.is_file() => stat,
                // Missing or non-file paths are skipped, not a stall — the
                // quarterly drop may simply not be there yet.
                _ => continue,
            };
            let mtime = stat.mtime.unwrap_or(0);
            if let Some(seen) = processed_mtime(ctx, &self.id, path).await? {
                if seen >= mtime {
                    continue;
                }
            }
            let item_key = format!("{path}@{mtime}");
            if EmissionGuard::already_emitted(ctx, &self.id, &item_key).await? {
                continue;
            }

            EmissionGuard::mark_emitted(ctx, &self.id, &item_key).await?;
            info!(locator_id = %self.id, path = %path, mtime, "file emitted");
            // The processed marker for fixed paths is keyed by full path.
            bundles.push(bundle_for_file(&self.id, "", path, stat.mtime, stat.size));
        }
        lease.release().await;
        Ok(bundles)
    }

    async fn on_bundle_complete(
        &self,
        ctx: &FetchRunContext,
        bundle: &BundleRef,
    ) -> Result<(), LocatorError> {
        if let Some((path, mtime)) = owned_bundle_file(&self.id, bundle) {
            record_processed(ctx, &self.id, &path, mtime).await?;
            debug!(locator_id = %self.id, path = %path, mtime, "file checkpointed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileSftpLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSftpLocator")
            .field("id", &self.id)
            .field("file_paths", &self.file_paths.len())
            .finish_non_exhaustive()
    }
}
