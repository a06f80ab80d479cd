//! Sink decorators.
//!
//! Both decorators stage incoming streams in temp files so they can inspect
//! or repackage the bytes, then delegate to the wrapped sink. They preserve
//! the [`ResourceSink`] contract, so the lifecycle context never knows they
//! are there.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StorageError;
use crate::model::{BundleRef, MetaMap, ResourceMeta};
use crate::storage::{CompletedResource, ResourceSink, ResourceStream};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Stream a resource into a fresh temp file and return its path guard.
async fn stage_stream(mut stream: ResourceStream) -> Result<TempPath, StorageError> {
    let temp = tokio::task::spawn_blocking(tempfile::NamedTempFile::new)
        .await
        .map_err(|e| StorageError::Sink {
            reason: format!("staging task failed: {e}"),
        })??;
    let path = temp.into_temp_path();
    let mut file = tokio::fs::File::create(&path).await?;
    tokio::io::copy(&mut stream, &mut file).await?;
    file.sync_all().await?;
    Ok(path)
}

/// Open a staged file as a resource stream.
async fn stream_from(path: &TempPath) -> Result<ResourceStream, StorageError> {
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::new(file))
}

/// Transparently decompresses gzipped resources before they reach the
/// wrapped sink. Detection is by `.gz` name suffix or the gzip magic bytes;
/// when decompression fails the original bytes are stored unchanged.
pub struct GzipUnwrapSink {
    inner: Arc<dyn ResourceSink>,
}

impl GzipUnwrapSink {
    /// Wrap a sink.
    #[must_use]
    pub fn new(inner: Arc<dyn ResourceSink>) -> Self {
        Self { inner }
    }

    async fn looks_gzipped(name: &str, staged: &TempPath) -> bool {
        if name.ends_with(".gz") {
            return true;
        }
        let Ok(mut file) = tokio::fs::File::open(staged).await else {
            return false;
        };
        let mut magic = [0u8; 2];
        matches!(file.read_exact(&mut magic).await, Ok(_) if magic == GZIP_MAGIC)
    }

    /// Decompress `staged` into a new temp file.
    async fn decompress(staged_path: std::path::PathBuf) -> Result<TempPath, StorageError> {
        tokio::task::spawn_blocking(move || -> Result<TempPath, StorageError> {
            let source = std::fs::File::open(&staged_path)?;
            let mut decoder = flate2::read::GzDecoder::new(source);
            let mut out = tempfile::NamedTempFile::new()?;
            std::io::copy(&mut decoder, &mut out)?;
            Ok(out.into_temp_path())
        })
        .await
        .map_err(|e| StorageError::Sink {
            reason: format!("decompression task failed: {e}"),
        })?
    }
}

#[async_trait::async_trait]
impl ResourceSink for GzipUnwrapSink {
    async fn open_bundle(&self, bundle: &BundleRef) -> Result<(), StorageError> {
        self.inner.open_bundle(bundle).await
    }

    async fn write_resource(
        &self,
        bundle: &BundleRef,
        name: &str,
        meta: &ResourceMeta,
        stream: ResourceStream,
    ) -> Result<(), StorageError> {
        let staged = stage_stream(stream).await?;

        if !Self::looks_gzipped(name, &staged).await {
            let stream = stream_from(&staged).await?;
            return self.inner.write_resource(bundle, name, meta, stream).await;
        }

        match Self::decompress(staged.to_path_buf()).await {
            Ok(decompressed) => {
                let mut meta = meta.clone();
                meta.note = Some("decompressed from gzip".to_owned());
                let name = name.strip_suffix(".gz").unwrap_or(name);
                let stream = stream_from(&decompressed).await?;
                self.inner.write_resource(bundle, name, &meta, stream).await
            }
            Err(err) => {
                // Mislabeled or corrupt gzip: store the original bytes.
                warn!(
                    bid = %bundle.bid,
                    resource = name,
                    error = %err,
                    "gzip decompression failed, storing original bytes"
                );
                let stream = stream_from(&staged).await?;
                self.inner.write_resource(bundle, name, meta, stream).await
            }
        }
    }

    async fn complete_bundle(
        &self,
        bundle: &BundleRef,
        resources: &[CompletedResource],
        metadata: &MetaMap,
    ) -> Result<Option<String>, StorageError> {
        self.inner.complete_bundle(bundle, resources, metadata).await
    }
}

struct StagedResource {
    name: String,
    path: TempPath,
}

/// Collects every resource of a bundle and writes one zip archive to the
/// wrapped sink at completion.
pub struct ArchiveBundleSink {
    inner: Arc<dyn ResourceSink>,
    staged: Mutex<HashMap<String, Vec<StagedResource>>>,
}

impl ArchiveBundleSink {
    /// Wrap a sink.
    #[must_use]
    pub fn new(inner: Arc<dyn ResourceSink>) -> Self {
        Self {
            inner,
            staged: Mutex::new(HashMap::new()),
        }
    }

    fn build_zip(staged: Vec<StagedResource>) -> Result<TempPath, StorageError> {
        let out = tempfile::NamedTempFile::new()?;
        let mut zip = zip::ZipWriter::new(out);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for resource in &staged {
            zip.start_file(resource.name.clone(), options)
                .map_err(|e| StorageError::Sink {
                    reason: format!("zip entry '{}' failed: {e}", resource.name),
                })?;
            let mut source = std::fs::File::open(&resource.path)?;
            let mut buf = [0u8; 8192];
            loop {
                let read = source.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                std::io::Write::write_all(&mut zip, &buf[..read])?;
            }
        }

        let out = zip.finish().map_err(|e| StorageError::Sink {
            reason: format!("zip finalization failed: {e}"),
        })?;
        Ok(out.into_temp_path())
    }
}

#[async_trait::async_trait]
impl ResourceSink for ArchiveBundleSink {
    async fn open_bundle(&self, bundle: &BundleRef) -> Result<(), StorageError> {
        self.inner.open_bundle(bundle).await?;
        let mut staged = self.staged.lock().await;
        staged.insert(bundle.bid.to_string(), Vec::new());
        Ok(())
    }

    async fn write_resource(
        &self,
        bundle: &BundleRef,
        name: &str,
        _meta: &ResourceMeta,
        stream: ResourceStream,
    ) -> Result<(), StorageError> {
        let path = stage_stream(stream).await?;
        let mut staged = self.staged.lock().await;
        let entries = staged
            .get_mut(&bundle.bid.to_string())
            .ok_or_else(|| StorageError::BundleNotOpen {
                bid: bundle.bid.to_string(),
            })?;
        entries.push(StagedResource {
            name: name.to_owned(),
            path,
        });
        Ok(())
    }

    async fn complete_bundle(
        &self,
        bundle: &BundleRef,
        resources: &[CompletedResource],
        metadata: &MetaMap,
    ) -> Result<Option<String>, StorageError> {
        let entries = {
            let mut staged = self.staged.lock().await;
            staged
                .remove(&bundle.bid.to_string())
                .ok_or_else(|| StorageError::BundleNotOpen {
                    bid: bundle.bid.to_string(),
                })?
        };

        let member_count = entries.len();
        let archive = tokio::task::spawn_blocking(move || Self::build_zip(entries))
            .await
            .map_err(|e| StorageError::Sink {
                reason: format!("archive task failed: {e}"),
            })??;

        let mut zip_meta = ResourceMeta::for_url(bundle.primary_url.clone());
        zip_meta.content_type = Some("application/zip".to_owned());
        zip_meta.note = Some(format!("archive of {member_count} resources"));
        let stream = stream_from(&archive).await?;
        self.inner
            .write_resource(bundle, "bundle.zip", &zip_meta, stream)
            .await?;

        let archived = [CompletedResource {
            name: "bundle.zip".to_owned(),
            meta: zip_meta,
        }];
        // The original resource records still describe the bundle contents;
        // the wrapped sink's manifest lists what it actually stored.
        let _ = resources;
        self.inner.complete_bundle(bundle, &archived, metadata).await
    }
}
