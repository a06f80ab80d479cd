//! The fetch scheduler.
//!
//! One producer task polls the recipe's locators round-robin and feeds the
//! persistent queue; `concurrency` worker tasks drain it through the
//! loader. The producer checkpoints nothing itself — locators own their
//! cursors — it only enforces backpressure and records stalls. Termination:
//! the producer declares the run drained when a full polling round emits
//! nothing, the queue is empty, and no worker is mid-item; workers exit
//! once drained and empty. Cancellation is cooperative and stops the
//! producer first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocfetch_kv::Codec;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{FetchError, LocatorError, QueueError};
use crate::model::{FetchPlan, FetchRunContext, FetcherRecipe, RequestMeta};
use crate::queue::KvRequestQueue;
use crate::strategy::{BundleLoader as _, BundleLocator, RequestOutcome};

/// One recorded failure from a run.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    /// URL of the failed request, when known.
    pub url: Option<String>,
    /// BID of the affected bundle, when known.
    pub bid: Option<String>,
    /// Stable error kind string (see [`FetchError::kind`]).
    pub error_kind: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// Result of a fetch run.
#[derive(Debug, Default)]
pub struct FetchResult {
    /// Requests handled without error (including deliberate discards).
    pub processed_count: u64,
    /// Bundles the loader produced and completed.
    pub bundles_completed: u64,
    /// Failures captured during the run. The run does not stop on them.
    pub errors: Vec<FetchFailure>,
}

/// Scheduler configuration and entry points.
#[derive(Debug, Clone)]
pub struct Fetcher {
    /// Producer sleep between polling rounds that emitted nothing.
    pub poll_interval: Duration,
    /// Worker sleep when the queue is momentarily empty.
    pub idle_sleep: Duration,
    /// How long cancelled in-flight loads get to finish.
    pub drain_grace: Duration,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(150),
            idle_sleep: Duration::from_millis(200),
            drain_grace: Duration::from_secs(30),
        }
    }
}

struct RunState {
    queue: KvRequestQueue,
    processed: AtomicU64,
    bundles: AtomicU64,
    /// Workers currently holding (or about to dequeue) an item.
    busy: AtomicUsize,
    drained: AtomicBool,
    errors: Mutex<Vec<FetchFailure>>,
}

impl RunState {
    fn record(&self, url: Option<String>, bid: Option<String>, err: &FetchError) {
        let failure = FetchFailure {
            url,
            bid,
            error_kind: err.kind(),
            message: err.to_string(),
        };
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(failure);
        }
    }
}

impl Fetcher {
    /// Create a scheduler with default pacing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute a plan to completion.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for invalid plans or an unusable queue
    /// namespace; per-request failures land in the result instead.
    pub async fn run(&self, plan: FetchPlan) -> Result<FetchResult, FetchError> {
        // Keep the sender alive so workers never observe a closed channel.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_with_shutdown(plan, shutdown_rx).await
    }

    /// Execute a plan with a cooperative shutdown signal. Flipping the
    /// watch value to `true` stops the producer immediately and lets
    /// in-flight loads finish within the drain grace period.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for invalid plans or an unusable queue
    /// namespace; per-request failures land in the result instead.
    pub async fn run_with_shutdown(
        &self,
        plan: FetchPlan,
        shutdown: watch::Receiver<bool>,
    ) -> Result<FetchResult, FetchError> {
        plan.validate()?;

        let recipe = Arc::clone(&plan.recipe);
        let ctx = Arc::clone(&plan.context);

        let queue = KvRequestQueue::new(
            Arc::clone(ctx.kv()),
            format!("fetch:{}:queue", ctx.run_id),
            Codec::Json,
        )?;

        let state = Arc::new(RunState {
            queue,
            processed: AtomicU64::new(0),
            bundles: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        });

        info!(
            run_id = %ctx.run_id,
            recipe_id = %recipe.recipe_id,
            concurrency = plan.concurrency,
            locators = recipe.locators.len(),
            "fetch run starting"
        );

        let producer = {
            let fetcher = self.clone();
            let state = Arc::clone(&state);
            let recipe = Arc::clone(&recipe);
            let ctx = Arc::clone(&ctx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                fetcher
                    .produce(&state, &recipe, &ctx, plan.concurrency, shutdown)
                    .await;
            })
        };

        let mut workers = Vec::with_capacity(plan.concurrency);
        for worker_id in 0..plan.concurrency {
            let fetcher = self.clone();
            let state = Arc::clone(&state);
            let recipe = Arc::clone(&recipe);
            let ctx = Arc::clone(&ctx);
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                fetcher.work(worker_id, &state, &recipe, &ctx, shutdown).await;
            }));
        }

        let _ = producer.await;

        let was_cancelled = *shutdown.borrow();
        if was_cancelled {
            // Give in-flight loads the grace period, then cut them loose.
            let drain = futures::future::join_all(workers);
            if tokio::time::timeout(self.drain_grace, drain).await.is_err() {
                warn!(run_id = %ctx.run_id, "drain grace expired with loads still in flight");
            }
        } else {
            for worker in workers {
                let _ = worker.await;
            }
        }

        state.queue.close().await;

        let errors = state
            .errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default();
        let result = FetchResult {
            processed_count: state.processed.load(Ordering::SeqCst),
            bundles_completed: state.bundles.load(Ordering::SeqCst),
            errors,
        };

        info!(
            run_id = %ctx.run_id,
            recipe_id = %recipe.recipe_id,
            processed = result.processed_count,
            bundles = result.bundles_completed,
            errors = result.errors.len(),
            cancelled = was_cancelled,
            "fetch run finished"
        );
        Ok(result)
    }

    async fn produce(
        &self,
        state: &Arc<RunState>,
        recipe: &Arc<FetcherRecipe>,
        ctx: &Arc<FetchRunContext>,
        concurrency: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let high_water = concurrency * 2 + 8;
        let mut stalled: HashSet<String> = HashSet::new();

        loop {
            if *shutdown.borrow() {
                debug!(run_id = %ctx.run_id, "producer cancelled");
                return;
            }

            let size = match state.queue.size().await {
                Ok(size) => size,
                Err(err) => {
                    state.record(None, None, &FetchError::from(err));
                    self.pause(&mut shutdown, self.poll_interval).await;
                    continue;
                }
            };

            let mut emitted = 0usize;
            if size < high_water {
                let needed = high_water - size;
                for locator in &recipe.locators {
                    if stalled.contains(locator.locator_id()) {
                        continue;
                    }
                    emitted += self
                        .poll_locator(state, ctx, locator, needed, &mut stalled)
                        .await;
                }
            }

            if emitted == 0 {
                let remaining = state.queue.size().await.unwrap_or(1);
                if remaining == 0 && state.busy.load(Ordering::SeqCst) == 0 && size < high_water {
                    state.drained.store(true, Ordering::SeqCst);
                    debug!(run_id = %ctx.run_id, "producer drained");
                    return;
                }
                self.pause(&mut shutdown, self.poll_interval).await;
            }
        }
    }

    async fn poll_locator(
        &self,
        state: &Arc<RunState>,
        ctx: &Arc<FetchRunContext>,
        locator: &Arc<dyn BundleLocator>,
        needed: usize,
        stalled: &mut HashSet<String>,
    ) -> usize {
        match locator.next_bundle_refs(ctx, needed).await {
            Ok(bundles) => {
                let mut emitted = 0;
                for bundle in bundles {
                    if let Err(err) = bundle.validate() {
                        state.record(
                            Some(bundle.primary_url.clone()),
                            Some(bundle.bid.to_string()),
                            &FetchError::from(err),
                        );
                        continue;
                    }
                    let request = RequestMeta::from_bundle(&bundle, locator.locator_id());
                    match state.queue.enqueue(std::slice::from_ref(&request)).await {
                        Ok(_) => emitted += 1,
                        Err(err) => {
                            state.record(
                                Some(bundle.primary_url.clone()),
                                Some(bundle.bid.to_string()),
                                &FetchError::from(err),
                            );
                        }
                    }
                }
                emitted
            }
            Err(err @ LocatorError::Stalled { .. }) => {
                warn!(
                    run_id = %ctx.run_id,
                    locator_id = locator.locator_id(),
                    error = %err,
                    "locator stalled, continuing with remaining locators"
                );
                stalled.insert(locator.locator_id().to_owned());
                state.record(None, None, &FetchError::from(err));
                0
            }
            Err(err) => {
                state.record(None, None, &FetchError::from(err));
                0
            }
        }
    }

    async fn work(
        &self,
        worker_id: usize,
        state: &Arc<RunState>,
        recipe: &Arc<FetcherRecipe>,
        ctx: &Arc<FetchRunContext>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                debug!(run_id = %ctx.run_id, worker_id, "worker cancelled");
                return;
            }

            // Count ourselves busy before touching the queue so the producer
            // cannot declare the run drained mid-dequeue.
            state.busy.fetch_add(1, Ordering::SeqCst);
            let dequeued = state.queue.dequeue(1).await;

            match dequeued {
                Ok(mut items) => match items.pop() {
                    Some(request) => {
                        self.process(state, recipe, ctx, &request).await;
                        state.busy.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => {
                        state.busy.fetch_sub(1, Ordering::SeqCst);
                        if state.drained.load(Ordering::SeqCst) {
                            debug!(run_id = %ctx.run_id, worker_id, "worker finished");
                            return;
                        }
                        self.pause(&mut shutdown, self.idle_sleep).await;
                    }
                },
                Err(err) => {
                    state.busy.fetch_sub(1, Ordering::SeqCst);
                    state.record(None, None, &FetchError::from(err));
                    self.pause(&mut shutdown, self.idle_sleep).await;
                }
            }
        }
    }

    async fn process(
        &self,
        state: &Arc<RunState>,
        recipe: &Arc<FetcherRecipe>,
        ctx: &Arc<FetchRunContext>,
        request: &RequestMeta,
    ) {
        let locator = request
            .locator_id()
            .and_then(|id| recipe.locator(id))
            .cloned();

        let outcome = match recipe
            .loader
            .load(request, ctx.storage(), ctx, recipe)
            .await
        {
            Ok(bundles) => {
                state.processed.fetch_add(1, Ordering::SeqCst);
                state
                    .bundles
                    .fetch_add(bundles.len() as u64, Ordering::SeqCst);
                if bundles.is_empty() {
                    RequestOutcome::Discarded
                } else {
                    RequestOutcome::Loaded {
                        bundles: bundles.len(),
                    }
                }
            }
            Err(err) => {
                let err = FetchError::from(err);
                warn!(
                    run_id = %ctx.run_id,
                    recipe_id = %recipe.recipe_id,
                    url = %request.url,
                    error_kind = err.kind(),
                    error = %err,
                    "request failed"
                );
                state.record(
                    Some(request.url.clone()),
                    request.bundle().ok().map(|b| b.bid.to_string()),
                    &err,
                );
                RequestOutcome::Failed
            }
        };

        if let Some(locator) = locator {
            if let Err(err) = locator
                .handle_request_processed(ctx, request, outcome)
                .await
            {
                state.record(Some(request.url.clone()), None, &FetchError::from(err));
            }
        }
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::EnvCredentialProvider;
    use crate::error::{LoaderError, StorageError};
    use crate::model::{AppConfig, BundleRef, MetaMap, ResourceMeta};
    use crate::storage::{FileStorage, Storage};
    use crate::strategy::BundleLoader;
    use ocfetch_kv::MemoryKvStore;

    /// Locator that serves a fixed URL list once, straight from memory.
    struct ListLocator {
        id: String,
        remaining: Mutex<Vec<String>>,
    }

    impl ListLocator {
        fn new(id: &str, urls: &[&str]) -> Self {
            Self {
                id: id.to_owned(),
                remaining: Mutex::new(urls.iter().rev().map(|&u| u.to_owned()).collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BundleLocator for ListLocator {
        fn locator_id(&self) -> &str {
            &self.id
        }

        async fn next_bundle_refs(
            &self,
            _ctx: &FetchRunContext,
            needed: usize,
        ) -> Result<Vec<BundleRef>, LocatorError> {
            let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
            let mut bundles = Vec::new();
            for _ in 0..needed {
                match remaining.pop() {
                    Some(url) => bundles.push(BundleRef::new(url)),
                    None => break,
                }
            }
            Ok(bundles)
        }
    }

    /// Loader that writes the request URL as the bundle's single resource.
    struct EchoLoader;

    #[async_trait::async_trait]
    impl BundleLoader for EchoLoader {
        async fn load(
            &self,
            request: &RequestMeta,
            storage: &Arc<dyn Storage>,
            ctx: &Arc<FetchRunContext>,
            recipe: &Arc<FetcherRecipe>,
        ) -> Result<Vec<BundleRef>, LoaderError> {
            let bundle = request.bundle().map_err(|e| LoaderError::Resource {
                url: request.url.clone(),
                reason: e.to_string(),
            })?;
            let context = storage
                .start_bundle(bundle.clone(), Arc::clone(recipe), Arc::clone(ctx))
                .await
                .map_err(LoaderError::Storage)?;
            context
                .add_resource(
                    "page.txt",
                    ResourceMeta::for_url(request.url.clone()),
                    Box::new(std::io::Cursor::new(request.url.clone().into_bytes())),
                )
                .await
                .map_err(LoaderError::Storage)?;
            context
                .complete(MetaMap::new())
                .await
                .map_err(LoaderError::Storage)?;
            Ok(vec![bundle])
        }
    }

    /// Loader that always errors.
    struct FailingLoader;

    #[async_trait::async_trait]
    impl BundleLoader for FailingLoader {
        async fn load(
            &self,
            request: &RequestMeta,
            _storage: &Arc<dyn Storage>,
            _ctx: &Arc<FetchRunContext>,
            _recipe: &Arc<FetcherRecipe>,
        ) -> Result<Vec<BundleRef>, LoaderError> {
            Err(LoaderError::Storage(StorageError::Sink {
                reason: format!("refused {}", request.url),
            }))
        }
    }

    fn app_config(root: &std::path::Path) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            credential_provider: Arc::new(EnvCredentialProvider::new("OCT_FETCH_")),
            kv_store: Arc::new(MemoryKvStore::new()),
            storage: Arc::new(FileStorage::builder(root).build().unwrap()),
        })
    }

    fn quick_fetcher() -> Fetcher {
        Fetcher {
            poll_interval: Duration::from_millis(10),
            idle_sleep: Duration::from_millis(10),
            drain_grace: Duration::from_secs(5),
        }
    }

    fn plan_for(
        recipe: FetcherRecipe,
        app_config: Arc<AppConfig>,
        concurrency: usize,
    ) -> FetchPlan {
        FetchPlan::new(
            Arc::new(recipe),
            Arc::new(FetchRunContext::new("run-sched", app_config)),
            concurrency,
        )
    }

    #[tokio::test]
    async fn empty_locator_list_terminates_immediately() {
        let root = tempfile::tempdir().unwrap();
        let recipe = FetcherRecipe::builder("empty")
            .loader(Arc::new(EchoLoader))
            .build()
            .unwrap();
        let plan = plan_for(recipe, app_config(root.path()), 2);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            quick_fetcher().run(plan),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.processed_count, 0);
        assert_eq!(result.bundles_completed, 0);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let recipe = FetcherRecipe::builder("zero")
            .loader(Arc::new(EchoLoader))
            .build()
            .unwrap();
        let plan = plan_for(recipe, app_config(root.path()), 0);

        let err = quick_fetcher().run(plan).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn all_emitted_requests_are_processed_exactly_once() {
        let root = tempfile::tempdir().unwrap();
        let urls: Vec<String> = (0..12).map(|i| format!("https://example.com/{i}")).collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();

        let recipe = FetcherRecipe::builder("batch")
            .loader(Arc::new(EchoLoader))
            .locator(Arc::new(ListLocator::new("list", &url_refs)))
            .build()
            .unwrap();
        let plan = plan_for(recipe, app_config(root.path()), 3);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            quick_fetcher().run(plan),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.processed_count, 12);
        assert_eq!(result.bundles_completed, 12);
        assert!(result.errors.is_empty());

        // Every bundle directory was finalized.
        let completed = std::fs::read_dir(root.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .map(|e| e.path().join("bundle.meta").exists())
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(completed, 12);
    }

    #[tokio::test]
    async fn loader_failures_are_recorded_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let recipe = FetcherRecipe::builder("failing")
            .loader(Arc::new(FailingLoader))
            .locator(Arc::new(ListLocator::new(
                "list",
                &["https://example.com/a", "https://example.com/b"],
            )))
            .build()
            .unwrap();
        let plan = plan_for(recipe, app_config(root.path()), 2);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            quick_fetcher().run(plan),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.processed_count, 0);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().all(|e| e.error_kind == "storage"));
        assert!(result.errors.iter().any(|e| e
            .url
            .as_deref()
            .is_some_and(|u| u.ends_with("/a"))));
    }

    #[tokio::test]
    async fn stalled_locator_does_not_stop_other_locators() {
        struct StalledLocator;

        #[async_trait::async_trait]
        impl BundleLocator for StalledLocator {
            fn locator_id(&self) -> &str {
                "stalled"
            }

            async fn next_bundle_refs(
                &self,
                _ctx: &FetchRunContext,
                _needed: usize,
            ) -> Result<Vec<BundleRef>, LocatorError> {
                Err(LocatorError::Stalled {
                    locator_id: "stalled".to_owned(),
                    reason: "retries exhausted".to_owned(),
                })
            }
        }

        let root = tempfile::tempdir().unwrap();
        let recipe = FetcherRecipe::builder("mixed")
            .loader(Arc::new(EchoLoader))
            .locator(Arc::new(StalledLocator))
            .locator(Arc::new(ListLocator::new("ok", &["https://example.com/x"])))
            .build()
            .unwrap();
        let plan = plan_for(recipe, app_config(root.path()), 2);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            quick_fetcher().run(plan),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.processed_count, 1);
        assert!(result
            .errors
            .iter()
            .any(|e| e.error_kind == "retryable" && e.message.contains("stalled")));
    }

    #[tokio::test]
    async fn cancellation_stops_an_endless_run() {
        /// Locator with an infinite supply of URLs.
        struct EndlessLocator {
            counter: AtomicU64,
        }

        #[async_trait::async_trait]
        impl BundleLocator for EndlessLocator {
            fn locator_id(&self) -> &str {
                "endless"
            }

            async fn next_bundle_refs(
                &self,
                _ctx: &FetchRunContext,
                needed: usize,
            ) -> Result<Vec<BundleRef>, LocatorError> {
                let mut bundles = Vec::new();
                for _ in 0..needed.min(4) {
                    let n = self.counter.fetch_add(1, Ordering::SeqCst);
                    bundles.push(BundleRef::new(format!("https://example.com/{n}")));
                }
                Ok(bundles)
            }
        }

        let root = tempfile::tempdir().unwrap();
        let recipe = FetcherRecipe::builder("endless")
            .loader(Arc::new(EchoLoader))
            .locator(Arc::new(EndlessLocator {
                counter: AtomicU64::new(0),
            }))
            .build()
            .unwrap();
        let plan = plan_for(recipe, app_config(root.path()), 2);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let fetcher = quick_fetcher();
        let run = tokio::spawn(async move { fetcher.run_with_shutdown(plan, shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Something was processed before cancellation, and the run ended.
        assert!(result.processed_count > 0);
    }
}
