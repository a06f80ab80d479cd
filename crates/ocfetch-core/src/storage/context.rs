//! Bundle lifecycle context.
//!
//! Tracks pending and completed uploads for one bundle and gates
//! `complete()` behind an edge-triggered idle signal: the signal flips to
//! busy when the first upload starts and back to idle when the last one
//! finishes (success or failure). `complete()` waits for idle, runs the
//! sink's finalization at most once, fires the recipe hooks, and publishes
//! the completion notification.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, MetaMap, ResourceMeta};
use crate::notify::{BundleCompletionEvent, NotificationPublisher};
use crate::storage::{CompletedResource, ResourceSink, ResourceStream};
use crate::strategy::{BundleLoader as _, BundleLocator as _};

#[derive(Debug, Default)]
struct UploadState {
    pending: HashSet<String>,
    completed: Vec<CompletedResource>,
    next_upload_seq: u64,
    is_completed: bool,
}

/// Stateful handle for one bundle's storage lifecycle.
///
/// Safe to share across tasks: `add_resource` may be called concurrently
/// from multiple producers; `complete` is idempotent and never runs while
/// an upload is pending.
pub struct BundleStorageContext {
    bundle: BundleRef,
    recipe: Arc<FetcherRecipe>,
    ctx: Arc<FetchRunContext>,
    sink: Arc<dyn ResourceSink>,
    publisher: Option<Arc<dyn NotificationPublisher>>,
    state: Mutex<UploadState>,
    /// `true` while no uploads are pending.
    idle: watch::Sender<bool>,
}

impl BundleStorageContext {
    /// Create a context for an opened bundle.
    #[must_use]
    pub fn new(
        bundle: BundleRef,
        recipe: Arc<FetcherRecipe>,
        ctx: Arc<FetchRunContext>,
        sink: Arc<dyn ResourceSink>,
        publisher: Option<Arc<dyn NotificationPublisher>>,
    ) -> Self {
        // Idle until the first upload begins.
        let (idle, _) = watch::channel(true);
        Self {
            bundle,
            recipe,
            ctx,
            sink,
            publisher,
            state: Mutex::new(UploadState::default()),
            idle,
        }
    }

    /// The bundle this context manages.
    #[must_use]
    pub fn bundle(&self) -> &BundleRef {
        &self.bundle
    }

    /// Stream one resource into the bundle. Concurrent calls are fine;
    /// upload order within a bundle is not guaranteed.
    ///
    /// # Errors
    ///
    /// Re-raises the sink's [`StorageError`] after the pending bookkeeping
    /// is unwound, so a failed upload never wedges `complete()`.
    pub async fn add_resource(
        &self,
        name: &str,
        meta: ResourceMeta,
        stream: ResourceStream,
    ) -> Result<(), StorageError> {
        let upload_id = {
            let mut state = self.state.lock().await;
            let seq = state.next_upload_seq;
            state.next_upload_seq += 1;
            let upload_id = format!("{name}#{seq}");
            state.pending.insert(upload_id.clone());
            if state.pending.len() == 1 {
                self.idle.send_replace(false);
            }
            upload_id
        };

        let result = self
            .sink
            .write_resource(&self.bundle, name, &meta, stream)
            .await;

        {
            let mut state = self.state.lock().await;
            state.pending.remove(&upload_id);
            if result.is_ok() {
                state.completed.push(CompletedResource {
                    name: name.to_owned(),
                    meta,
                });
            }
            if state.pending.is_empty() {
                self.idle.send_replace(true);
            }
        }

        result
    }

    /// Complete the bundle. Waits for all in-flight uploads, finalizes the
    /// sink at most once, runs the loader/locator hooks (hook errors are
    /// logged, never fatal), and publishes the completion notification.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if sink finalization or notification fails.
    pub async fn complete(&self, metadata: MetaMap) -> Result<(), StorageError> {
        // Wait until zero uploads are pending.
        let mut idle_rx = self.idle.subscribe();
        // The sender lives on self, so the channel cannot close under us.
        let _ = idle_rx.wait_for(|idle| *idle).await;

        let resources = {
            let mut state = self.state.lock().await;
            if state.is_completed {
                return Ok(());
            }
            state.is_completed = true;
            state.completed.clone()
        };

        let resources_count =
            u32::try_from(resources.len()).unwrap_or(u32::MAX).max(self.bundle.resources_count);

        let storage_key = self
            .sink
            .complete_bundle(&self.bundle, &resources, &metadata)
            .await?;

        debug!(
            bid = %self.bundle.bid,
            recipe_id = %self.recipe.recipe_id,
            resources = resources.len(),
            "bundle finalized"
        );

        self.run_completion_hooks().await;

        if let Some(publisher) = &self.publisher {
            let event = BundleCompletionEvent::new(
                &self.bundle,
                &self.recipe.recipe_id,
                resources_count,
                storage_key.clone().or_else(|| self.bundle.storage_key.clone()),
                metadata,
            );
            publisher.publish(&event).await?;
        }

        Ok(())
    }

    /// Fire the loader and locator hooks. Errors are logged and swallowed —
    /// a broken checkpoint must not fail an already-finalized bundle.
    async fn run_completion_hooks(&self) {
        if let Err(err) = self
            .recipe
            .loader
            .on_bundle_complete(&self.ctx, &self.bundle)
            .await
        {
            warn!(
                bid = %self.bundle.bid,
                recipe_id = %self.recipe.recipe_id,
                error = %err,
                "loader completion hook failed"
            );
        }

        for locator in &self.recipe.locators {
            if let Err(err) = locator.on_bundle_complete(&self.ctx, &self.bundle).await {
                warn!(
                    bid = %self.bundle.bid,
                    recipe_id = %self.recipe.recipe_id,
                    locator_id = locator.locator_id(),
                    error = %err,
                    "locator completion hook failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for BundleStorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStorageContext")
            .field("bid", &self.bundle.bid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::EnvCredentialProvider;
    use crate::error::{LoaderError, NotifyError};
    use crate::model::AppConfig;
    use crate::notify::NotificationPublisher;
    use crate::storage::Storage;
    use crate::strategy::BundleLoader;
    use ocfetch_kv::MemoryKvStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Sink that records writes and sleeps to widen race windows.
    #[derive(Default)]
    struct SlowSink {
        writes: AtomicU32,
        completes: AtomicU32,
        fail_writes: bool,
        write_delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl ResourceSink for SlowSink {
        async fn open_bundle(&self, _bundle: &BundleRef) -> Result<(), StorageError> {
            Ok(())
        }

        async fn write_resource(
            &self,
            _bundle: &BundleRef,
            _name: &str,
            _meta: &ResourceMeta,
            mut stream: ResourceStream,
        ) -> Result<(), StorageError> {
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_writes {
                return Err(StorageError::Sink {
                    reason: "write refused".to_owned(),
                });
            }
            let mut buf = Vec::new();
            tokio::io::copy(&mut stream, &mut buf).await?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn complete_bundle(
            &self,
            _bundle: &BundleRef,
            _resources: &[CompletedResource],
            _metadata: &MetaMap,
        ) -> Result<Option<String>, StorageError> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(Some("sink-key".to_owned()))
        }
    }

    struct NoopLoader;

    #[async_trait::async_trait]
    impl BundleLoader for NoopLoader {
        async fn load(
            &self,
            _request: &crate::model::RequestMeta,
            _storage: &Arc<dyn Storage>,
            _ctx: &Arc<FetchRunContext>,
            _recipe: &Arc<FetcherRecipe>,
        ) -> Result<Vec<BundleRef>, LoaderError> {
            Ok(Vec::new())
        }
    }

    struct NullStorage;

    #[async_trait::async_trait]
    impl Storage for NullStorage {
        async fn start_bundle(
            &self,
            _bundle: BundleRef,
            _recipe: Arc<FetcherRecipe>,
            _ctx: Arc<FetchRunContext>,
        ) -> Result<Arc<BundleStorageContext>, StorageError> {
            Err(StorageError::Sink {
                reason: "unused".to_owned(),
            })
        }
    }

    #[derive(Default)]
    struct CountingPublisher {
        published: AtomicU32,
    }

    #[async_trait::async_trait]
    impl NotificationPublisher for CountingPublisher {
        async fn publish(&self, _event: &BundleCompletionEvent) -> Result<(), NotifyError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_context() -> Arc<FetchRunContext> {
        let app_config = Arc::new(AppConfig {
            credential_provider: Arc::new(EnvCredentialProvider::new("OCT_CTX_")),
            kv_store: Arc::new(MemoryKvStore::new()),
            storage: Arc::new(NullStorage),
        });
        Arc::new(FetchRunContext::new("run-test", app_config))
    }

    fn test_recipe() -> Arc<FetcherRecipe> {
        Arc::new(
            FetcherRecipe::builder("test")
                .loader(Arc::new(NoopLoader))
                .build()
                .unwrap(),
        )
    }

    fn stream_of(bytes: &'static [u8]) -> ResourceStream {
        Box::new(bytes)
    }

    fn make_context(
        sink: Arc<SlowSink>,
        publisher: Option<Arc<dyn NotificationPublisher>>,
    ) -> Arc<BundleStorageContext> {
        Arc::new(BundleStorageContext::new(
            BundleRef::new("https://example.com/bundle"),
            test_recipe(),
            test_context(),
            sink,
            publisher,
        ))
    }

    #[tokio::test]
    async fn complete_waits_for_concurrent_uploads() {
        let sink = Arc::new(SlowSink {
            write_delay: Some(Duration::from_millis(50)),
            ..SlowSink::default()
        });
        let publisher = Arc::new(CountingPublisher::default());
        let context = make_context(
            Arc::clone(&sink),
            Some(Arc::clone(&publisher) as Arc<dyn NotificationPublisher>),
        );

        let mut uploads = Vec::new();
        for i in 0..3 {
            let context = Arc::clone(&context);
            uploads.push(tokio::spawn(async move {
                context
                    .add_resource(
                        &format!("resource_{i}"),
                        ResourceMeta::for_url(format!("https://example.com/{i}")),
                        stream_of(b"payload"),
                    )
                    .await
            }));
        }
        // Give the uploads time to enter the pending set.
        tokio::time::sleep(Duration::from_millis(10)).await;

        context.complete(MetaMap::new()).await.unwrap();

        // Every upload finished before completion ran.
        assert_eq!(sink.writes.load(Ordering::SeqCst), 3);
        assert_eq!(sink.completes.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.published.load(Ordering::SeqCst), 1);

        for upload in uploads {
            upload.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_notifies_once() {
        let sink = Arc::new(SlowSink::default());
        let publisher = Arc::new(CountingPublisher::default());
        let context = make_context(
            Arc::clone(&sink),
            Some(Arc::clone(&publisher) as Arc<dyn NotificationPublisher>),
        );

        context
            .add_resource("r", ResourceMeta::for_url("u"), stream_of(b"x"))
            .await
            .unwrap();

        context.complete(MetaMap::new()).await.unwrap();
        context.complete(MetaMap::new()).await.unwrap();
        context.complete(MetaMap::new()).await.unwrap();

        assert_eq!(sink.completes.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.published.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_upload_unblocks_completion_and_propagates() {
        let sink = Arc::new(SlowSink {
            fail_writes: true,
            ..SlowSink::default()
        });
        let context = make_context(Arc::clone(&sink), None);

        let err = context
            .add_resource("r", ResourceMeta::for_url("u"), stream_of(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Sink { .. }));

        // The failed upload must not leave the idle gate down.
        tokio::time::timeout(Duration::from_millis(100), context.complete(MetaMap::new()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn complete_without_uploads_finalizes_immediately() {
        let sink = Arc::new(SlowSink::default());
        let context = make_context(Arc::clone(&sink), None);
        context.complete(MetaMap::new()).await.unwrap();
        assert_eq!(sink.completes.load(Ordering::SeqCst), 1);
    }
}
