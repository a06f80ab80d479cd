//! Strategy interfaces at the engine's seams.
//!
//! Locators produce bundle refs, loaders consume them, filters and gates
//! shape what the protocol crates do in between. Everything here is an
//! object-safe async trait so recipes can be assembled from declarative
//! configuration through the strategy registry.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{LoaderError, LocatorError};
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, RequestMeta};
use crate::storage::Storage;

/// Outcome of one dequeued request, reported back to the owning locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The loader produced and completed at least this many bundles.
    Loaded { bundles: usize },
    /// The loader deliberately discarded the response before bundle start
    /// (error handler, empty page). The request is consumed.
    Discarded,
    /// The loader failed; the request is consumed and an error was recorded.
    Failed,
}

/// Produces bundle refs and owns its persisted cursor.
#[async_trait::async_trait]
pub trait BundleLocator: Send + Sync {
    /// Stable identifier, used for state namespacing and request routing.
    fn locator_id(&self) -> &str;

    /// Return up to `needed` new bundle refs. Returning fewer (or none)
    /// means "no more right now" — the scheduler may poll again later.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::Stalled`] when retries are exhausted; the
    /// cursor must not have advanced in that case.
    async fn next_bundle_refs(
        &self,
        ctx: &FetchRunContext,
        needed: usize,
    ) -> Result<Vec<BundleRef>, LocatorError>;

    /// Called by the scheduler after every dequeued request it emitted,
    /// whatever the outcome. Used for retry bookkeeping and for advancing
    /// past pages that produced no bundle.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError`] if bookkeeping state cannot be persisted.
    async fn handle_request_processed(
        &self,
        ctx: &FetchRunContext,
        request: &RequestMeta,
        outcome: RequestOutcome,
    ) -> Result<(), LocatorError> {
        let _ = (ctx, request, outcome);
        Ok(())
    }

    /// Called by storage after a bundle this locator emitted is finalized.
    /// This is the point where cursors checkpoint atomically with
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError`] if checkpoint state cannot be persisted.
    async fn on_bundle_complete(
        &self,
        ctx: &FetchRunContext,
        bundle: &BundleRef,
    ) -> Result<(), LocatorError> {
        let _ = (ctx, bundle);
        Ok(())
    }
}

/// Consumes queued requests and drives the bundle storage lifecycle.
#[async_trait::async_trait]
pub trait BundleLoader: Send + Sync {
    /// Load the request's resources into storage. Returns the completed
    /// bundle refs; an empty vec means the load failed or was discarded —
    /// loaders do not raise for per-request failures.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError`] only for failures that should surface in the
    /// run result in addition to consuming the request (e.g. storage broke
    /// mid-bundle).
    async fn load(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn Storage>,
        ctx: &Arc<FetchRunContext>,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>, LoaderError>;

    /// Called by storage after a bundle completes. Hook errors are logged
    /// by storage and never fail completion.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError`] if loader-side bookkeeping fails.
    async fn on_bundle_complete(
        &self,
        ctx: &FetchRunContext,
        bundle: &BundleRef,
    ) -> Result<(), LoaderError> {
        let _ = (ctx, bundle);
        Ok(())
    }
}

/// Decides whether a remote file should be processed.
pub trait FileFilter: Send + Sync {
    /// Return `true` to keep the file.
    fn accept(&self, filename: &str) -> bool;
}

impl<F> FileFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn accept(&self, filename: &str) -> bool {
        self(filename)
    }
}

/// Blocks protocol operations during externally-defined windows
/// (maintenance, provider quiet hours). Checked before the rate gate.
#[async_trait::async_trait]
pub trait GatingStrategy: Send + Sync {
    /// Wait until operations are allowed.
    async fn wait_if_needed(&self);
}

/// Run-scoped emission guard shared by all locators.
///
/// Markers live under `fetch:<run_id>:emitted:<locator>:<item>` so a resumed
/// run (same `run_id`) does not re-enqueue items that are already in the
/// queue, while a fresh run starts clean and relies on the locators'
/// durable `processed:`/cursor state for cross-run dedup.
pub struct EmissionGuard;

impl EmissionGuard {
    /// TTL for emission markers; long enough to outlive any realistic run.
    const MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

    fn key(ctx: &FetchRunContext, locator_id: &str, item_key: &str) -> String {
        format!(
            "fetch:{}:emitted:{}:{}",
            ctx.run_id, locator_id, item_key
        )
    }

    /// Has this item already been emitted in this run?
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::Store`] if the KV store is unreachable.
    pub async fn already_emitted(
        ctx: &FetchRunContext,
        locator_id: &str,
        item_key: &str,
    ) -> Result<bool, LocatorError> {
        Ok(ctx.kv().exists(&Self::key(ctx, locator_id, item_key)).await?)
    }

    /// Record an emission.
    ///
    /// # Errors
    ///
    /// Returns [`LocatorError::Store`] if the KV store is unreachable.
    pub async fn mark_emitted(
        ctx: &FetchRunContext,
        locator_id: &str,
        item_key: &str,
    ) -> Result<(), LocatorError> {
        ctx.kv()
            .put(
                &Self::key(ctx, locator_id, item_key),
                b"1",
                Some(Self::MARKER_TTL),
            )
            .await?;
        Ok(())
    }
}
