//! Bundle storage: sinks, lifecycle context, and decorators.
//!
//! A [`Storage`] opens a [`BundleStorageContext`] per bundle; the context
//! enforces the lifecycle (concurrent resource uploads, then at-most-once
//! completion) while the [`ResourceSink`] does the actual writing. Sinks
//! compose: the gzip-unwrap and archive-bundling decorators wrap a base
//! sink and preserve the context contract.

mod context;
mod decorators;
mod file_store;
#[cfg(feature = "aws")]
mod pipeline_bus;

pub use context::BundleStorageContext;
pub use decorators::{ArchiveBundleSink, GzipUnwrapSink};
pub use file_store::{resource_name_for_url, FileStorage, FileStorageBuilder};
#[cfg(feature = "aws")]
pub use pipeline_bus::{PipelineBusSettings, PipelineBusStorage};

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::bid::Bid;
use crate::error::StorageError;
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, MetaMap, ResourceMeta};

/// Byte stream handed to `add_resource`. Sinks consume it exactly once.
pub type ResourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// A resource that finished uploading, as recorded by the context.
#[derive(Debug, Clone)]
pub struct CompletedResource {
    /// Resource name within the bundle.
    pub name: String,
    /// Per-resource metadata.
    pub meta: ResourceMeta,
}

/// Writes resources and completion markers for one sink flavor.
///
/// Implementations must tolerate concurrent `write_resource` calls for the
/// same bundle; ordering within a bundle is not guaranteed.
#[async_trait::async_trait]
pub trait ResourceSink: Send + Sync {
    /// Prepare sink-side state for a bundle (directory, discovery marker).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the sink cannot be prepared.
    async fn open_bundle(&self, bundle: &BundleRef) -> Result<(), StorageError>;

    /// Stream one resource into the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write fails; the stream may have
    /// been partially consumed.
    async fn write_resource(
        &self,
        bundle: &BundleRef,
        name: &str,
        meta: &ResourceMeta,
        stream: ResourceStream,
    ) -> Result<(), StorageError>;

    /// Finalize the bundle: manifests, completion markers, CDC pointers.
    /// Returns the sink-assigned storage key, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if finalization fails.
    async fn complete_bundle(
        &self,
        bundle: &BundleRef,
        resources: &[CompletedResource],
        metadata: &MetaMap,
    ) -> Result<Option<String>, StorageError>;
}

/// Storage facade handed to loaders.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Register the bundle as open and return its lifecycle context.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if sink-side setup fails.
    async fn start_bundle(
        &self,
        bundle: BundleRef,
        recipe: Arc<FetcherRecipe>,
        ctx: Arc<FetchRunContext>,
    ) -> Result<Arc<BundleStorageContext>, StorageError>;

    /// Mint (or echo) a BID for a discovered bundle. Sinks that delegate
    /// BID minting override this; the default honors a `bid` already in
    /// the metadata and mints otherwise.
    fn bundle_found(&self, metadata: &MetaMap) -> Bid {
        metadata
            .get("bid")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Bid::mint)
    }
}
