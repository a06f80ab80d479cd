//! API bundle locators.
//!
//! [`SingleUrlHttpLocator`] walks a fixed URL list; the pagination
//! locators walk date-sliced cursor queries. All durable state lives in
//! the KV store under `locator:<id>:…`; run-scoped emission markers keep a
//! resumed run from re-enqueuing what is already in the queue.
//!
//! Pagination cursor advancement (per completed or consumed page):
//! take the server's next cursor while the page count stays under
//! `max_records`; otherwise step the narrowing strategy; when the
//! narrowing is terminal, move the date one day (forward or backward) and
//! reset. The walk is finished once the date leaves the configured range.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use ocfetch_core::error::LocatorError;
use ocfetch_core::model::{BundleRef, FetchRunContext, MetaMap, RequestMeta};
use ocfetch_core::strategy::{BundleLocator, EmissionGuard, RequestOutcome};
use ocfetch_kv::Codec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Builds the provider-specific query string for one date slice.
pub trait QueryBuilder: Send + Sync {
    /// Build the query for `date`, optionally narrowed.
    fn build(&self, date: &str, narrowing: Option<&str>) -> String;
}

/// Template-driven query builder: `{date}` and `{narrowing}` placeholders.
///
/// With a narrowing template configured, the narrowed clause is prepended
/// to the date clause with `AND`.
#[derive(Debug, Clone)]
pub struct TemplateQueryBuilder {
    date_template: String,
    narrowing_template: Option<String>,
}

impl TemplateQueryBuilder {
    /// Create a builder from templates.
    #[must_use]
    pub fn new(date_template: impl Into<String>, narrowing_template: Option<String>) -> Self {
        Self {
            date_template: date_template.into(),
            narrowing_template,
        }
    }
}

impl QueryBuilder for TemplateQueryBuilder {
    fn build(&self, date: &str, narrowing: Option<&str>) -> String {
        let date_clause = self.date_template.replace("{date}", date);
        match (narrowing, &self.narrowing_template) {
            (Some(narrowing), Some(template)) => {
                format!("{} AND {date_clause}", template.replace("{narrowing}", narrowing))
            }
            _ => date_clause,
        }
    }
}

/// Subdivides a date bucket into finer filters when page counts would
/// exceed provider caps.
pub trait NarrowingStrategy: Send + Sync {
    /// The first narrowing key for a fresh date.
    fn first(&self) -> String;
    /// The key after `current`. Terminal keys map to themselves.
    fn next(&self, current: &str) -> String;
    /// Whether `current` is the last key for the date.
    fn is_terminal(&self, current: &str) -> bool;
}

/// Numeric prefix narrowing: `field:00`, `field:01`, ... `field:99` (for
/// `width` 2). The all-nines key is terminal.
#[derive(Debug, Clone)]
pub struct PrefixNarrowing {
    field: String,
    width: usize,
}

impl PrefixNarrowing {
    /// Create a narrowing over `field` with `width` digits.
    #[must_use]
    pub fn new(field: impl Into<String>, width: usize) -> Self {
        Self {
            field: field.into(),
            width: width.max(1),
        }
    }

    fn terminal_value(&self) -> String {
        format!("{}:{}", self.field, "9".repeat(self.width))
    }
}

impl NarrowingStrategy for PrefixNarrowing {
    fn first(&self) -> String {
        format!("{}:{:0width$}", self.field, 0, width = self.width)
    }

    fn next(&self, current: &str) -> String {
        if self.is_terminal(current) {
            return self.terminal_value();
        }
        let digits = current.rsplit(':').next().unwrap_or("");
        match digits.parse::<u64>() {
            Ok(n) => format!("{}:{:0width$}", self.field, n + 1, width = self.width),
            Err(_) => self.terminal_value(),
        }
    }

    fn is_terminal(&self, current: &str) -> bool {
        current == self.terminal_value()
    }
}

/// Names the provider's cursor/total/count response fields and the query
/// parameters used to request pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorPaginationSpec {
    /// Response field carrying the next-page cursor.
    pub cursor_field: String,
    /// Response field carrying the total record count for the query.
    pub total_field: String,
    /// Response field carrying this page's record count.
    pub count_field: String,
    /// Cap on records walked within one date/narrowing slice before the
    /// narrowing strategy subdivides.
    pub max_records: u64,
    /// Query parameter for the query string.
    #[serde(default = "default_query_param")]
    pub query_param: String,
    /// Query parameter for the page size.
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    /// Query parameter for the request cursor.
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
}

fn default_query_param() -> String {
    "q".to_owned()
}

fn default_page_size_param() -> String {
    "nombre".to_owned()
}

fn default_cursor_param() -> String {
    "curseur".to_owned()
}

impl Default for CursorPaginationSpec {
    fn default() -> Self {
        Self {
            cursor_field: "curseurSuivant".to_owned(),
            total_field: "total".to_owned(),
            count_field: "nombre".to_owned(),
            max_records: 20_000,
            query_param: default_query_param(),
            page_size_param: default_page_size_param(),
            cursor_param: default_cursor_param(),
        }
    }
}

// ── single-URL locator ───────────────────────────────────────────────

/// Emits one bundle per configured URL, exactly once across runs.
pub struct SingleUrlHttpLocator {
    id: String,
    urls: Vec<String>,
    headers: BTreeMap<String, String>,
}

impl SingleUrlHttpLocator {
    /// Create a locator over a fixed URL list.
    #[must_use]
    pub fn new(id: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            id: id.into(),
            urls,
            headers: BTreeMap::new(),
        }
    }

    /// Headers attached to every emitted request.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn processed_key(&self, index: usize) -> String {
        format!("locator:{}:processed:{index}", self.id)
    }

    fn index_of(bundle: &BundleRef) -> Option<usize> {
        bundle
            .meta
            .get("url_index")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
    }
}

#[async_trait::async_trait]
impl BundleLocator for SingleUrlHttpLocator {
    fn locator_id(&self) -> &str {
        &self.id
    }

    async fn next_bundle_refs(
        &self,
        ctx: &FetchRunContext,
        needed: usize,
    ) -> Result<Vec<BundleRef>, LocatorError> {
        let mut bundles = Vec::new();
        for (index, url) in self.urls.iter().enumerate() {
            if bundles.len() >= needed {
                break;
            }
            if ctx.kv().exists(&self.processed_key(index)).await? {
                continue;
            }
            let item_key = index.to_string();
            if EmissionGuard::already_emitted(ctx, &self.id, &item_key).await? {
                continue;
            }

            let mut meta = MetaMap::new();
            meta.insert("locator_id".to_owned(), self.id.clone().into());
            meta.insert("url_index".to_owned(), (index as u64).into());
            if !self.headers.is_empty() {
                meta.insert(
                    "headers".to_owned(),
                    serde_json::to_value(&self.headers).unwrap_or_default(),
                );
            }
            let bundle = BundleRef::new(url.clone()).with_meta(meta);

            EmissionGuard::mark_emitted(ctx, &self.id, &item_key).await?;
            bundles.push(bundle);
        }
        Ok(bundles)
    }

    async fn handle_request_processed(
        &self,
        ctx: &FetchRunContext,
        request: &RequestMeta,
        outcome: RequestOutcome,
    ) -> Result<(), LocatorError> {
        // Discards consume the URL; failures leave it for the next run.
        if outcome == RequestOutcome::Discarded {
            if let Some(index) = request.bundle().ok().as_ref().and_then(Self::index_of) {
                ctx.kv().put(&self.processed_key(index), b"1", None).await?;
            }
        }
        Ok(())
    }

    async fn on_bundle_complete(
        &self,
        ctx: &FetchRunContext,
        bundle: &BundleRef,
    ) -> Result<(), LocatorError> {
        if bundle.meta.get("locator_id").and_then(serde_json::Value::as_str) != Some(self.id.as_str())
        {
            return Ok(());
        }
        if let Some(index) = Self::index_of(bundle) {
            ctx.kv().put(&self.processed_key(index), b"1", None).await?;
            debug!(locator_id = %self.id, index, "url checkpointed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SingleUrlHttpLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleUrlHttpLocator")
            .field("id", &self.id)
            .field("urls", &self.urls.len())
            .finish_non_exhaustive()
    }
}

// ── pagination locators ──────────────────────────────────────────────

/// Walk direction over the date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationDirection {
    /// `date_start` towards `date_end` (daily ingestion).
    Forward,
    /// `date_end` towards `date_start` (gap filling).
    Reverse,
}

/// Persisted pagination cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PaginationCursor {
    current_date: NaiveDate,
    cursor_token: Option<String>,
    narrowing: Option<String>,
    /// Records seen within the current date/narrowing slice.
    records_seen: u64,
}

/// Date-sliced cursor-pagination locator.
///
/// Emits one bundle per result page. The page response's cursor/total/count
/// fields (extracted by the loader into the bundle meta) drive cursor
/// advancement in [`on_bundle_complete`](BundleLocator::on_bundle_complete);
/// pages that produce no bundle advance through
/// [`handle_request_processed`](BundleLocator::handle_request_processed) so
/// the walk cannot wedge on an empty slice.
pub struct PaginationHttpLocator {
    id: String,
    base_url: String,
    date_start: NaiveDate,
    date_end: NaiveDate,
    max_records_per_page: u32,
    headers: BTreeMap<String, String>,
    query_builder: Arc<dyn QueryBuilder>,
    pagination: CursorPaginationSpec,
    narrowing: Arc<dyn NarrowingStrategy>,
    direction: PaginationDirection,
    /// State prefix shared with a sibling locator for cross-locator dedup
    /// (the reverse locator names the forward locator's prefix here).
    dedup_prefix: String,
}

impl PaginationHttpLocator {
    /// Create a pagination locator.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        date_start: NaiveDate,
        date_end: NaiveDate,
        max_records_per_page: u32,
        query_builder: Arc<dyn QueryBuilder>,
        pagination: CursorPaginationSpec,
        narrowing: Arc<dyn NarrowingStrategy>,
        direction: PaginationDirection,
    ) -> Self {
        let id = id.into();
        Self {
            dedup_prefix: id.clone(),
            id,
            base_url: base_url.into(),
            date_start,
            date_end,
            max_records_per_page,
            headers: BTreeMap::new(),
            query_builder,
            pagination,
            narrowing,
            direction,
        }
    }

    /// Headers attached to every emitted request.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Share another locator's dedup namespace (gap filling must not
    /// re-emit pages the forward locator already processed).
    #[must_use]
    pub fn with_dedup_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dedup_prefix = prefix.into();
        self
    }

    fn cursor_key(&self) -> String {
        format!("locator:{}:cursor", self.id)
    }

    fn processed_key(&self, page_key: &str) -> String {
        format!("locator:{}:processed:{page_key}", self.dedup_prefix)
    }

    fn initial_cursor(&self) -> PaginationCursor {
        let current_date = match self.direction {
            PaginationDirection::Forward => self.date_start,
            PaginationDirection::Reverse => self.date_end,
        };
        PaginationCursor {
            current_date,
            cursor_token: None,
            narrowing: Some(self.narrowing.first()),
            records_seen: 0,
        }
    }

    fn is_done(&self, cursor: &PaginationCursor) -> bool {
        match self.direction {
            PaginationDirection::Forward => cursor.current_date > self.date_end,
            PaginationDirection::Reverse => cursor.current_date < self.date_start,
        }
    }

    async fn load_cursor(&self, ctx: &FetchRunContext) -> Result<PaginationCursor, LocatorError> {
        match ctx.kv().get(&self.cursor_key()).await? {
            Some(bytes) => Codec::Json
                .loads(&bytes)
                .map_err(|e| LocatorError::Cursor {
                    reason: format!("undecodable cursor for '{}': {e}", self.id),
                }),
            None => Ok(self.initial_cursor()),
        }
    }

    async fn store_cursor(
        &self,
        ctx: &FetchRunContext,
        cursor: &PaginationCursor,
    ) -> Result<(), LocatorError> {
        let bytes = Codec::Json.dumps(cursor).map_err(LocatorError::Store)?;
        ctx.kv().put(&self.cursor_key(), &bytes, None).await?;
        Ok(())
    }

    fn page_key(cursor: &PaginationCursor) -> String {
        format!(
            "{}|{}|{}",
            cursor.current_date,
            cursor.narrowing.as_deref().unwrap_or("-"),
            cursor.cursor_token.as_deref().unwrap_or("-"),
        )
    }

    fn page_url(&self, cursor: &PaginationCursor) -> String {
        let date = cursor.current_date.format("%Y-%m-%d").to_string();
        let query = self
            .query_builder
            .build(&date, cursor.narrowing.as_deref());
        let mut url = format!(
            "{}?{}={}&{}={}",
            self.base_url,
            self.pagination.query_param,
            query,
            self.pagination.page_size_param,
            self.max_records_per_page,
        );
        if let Some(token) = &cursor.cursor_token {
            url.push_str(&format!(
                "&{}={}",
                self.pagination.cursor_param,
                urlencoding::encode(token)
            ));
        }
        url
    }

    /// Advance past the current page. `response` carries the extracted
    /// response fields when the page produced a bundle.
    fn advanced(&self, cursor: &PaginationCursor, response: Option<&MetaMap>) -> PaginationCursor {
        let mut next = cursor.clone();

        let page_count = response
            .and_then(|r| r.get(&self.pagination.count_field))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        next.records_seen = next.records_seen.saturating_add(page_count);

        let next_token = response
            .and_then(|r| r.get(&self.pagination.cursor_field))
            .and_then(serde_json::Value::as_str)
            .filter(|token| !token.is_empty() && Some(*token) != cursor.cursor_token.as_deref());

        if let Some(token) = next_token {
            if next.records_seen < self.pagination.max_records {
                next.cursor_token = Some(token.to_owned());
                return next;
            }
        }

        // Slice exhausted (or provider cap reached): narrow, or move the date.
        next.cursor_token = None;
        next.records_seen = 0;
        let narrowing = cursor.narrowing.as_deref().unwrap_or_default();
        if !narrowing.is_empty() && !self.narrowing.is_terminal(narrowing) {
            next.narrowing = Some(self.narrowing.next(narrowing));
        } else {
            next.narrowing = Some(self.narrowing.first());
            next.current_date = match self.direction {
                PaginationDirection::Forward => cursor.current_date + chrono::Days::new(1),
                PaginationDirection::Reverse => cursor.current_date - chrono::Days::new(1),
            };
        }
        next
    }

    async fn consume_page(
        &self,
        ctx: &FetchRunContext,
        page_key: &str,
        response: Option<&MetaMap>,
    ) -> Result<(), LocatorError> {
        let cursor = self.load_cursor(ctx).await?;
        if Self::page_key(&cursor) != page_key {
            // Stale callback (page from an earlier cursor position).
            return Ok(());
        }
        let next = self.advanced(&cursor, response);
        ctx.kv().put(&self.processed_key(page_key), b"1", None).await?;
        self.store_cursor(ctx, &next).await?;
        debug!(
            locator_id = %self.id,
            page = page_key,
            date = %next.current_date,
            narrowing = next.narrowing.as_deref().unwrap_or("-"),
            "pagination cursor advanced"
        );
        Ok(())
    }

    fn owns(&self, meta: &MetaMap) -> bool {
        meta.get("locator_id").and_then(serde_json::Value::as_str) == Some(self.id.as_str())
    }
}

#[async_trait::async_trait]
impl BundleLocator for PaginationHttpLocator {
    fn locator_id(&self) -> &str {
        &self.id
    }

    async fn next_bundle_refs(
        &self,
        ctx: &FetchRunContext,
        _needed: usize,
    ) -> Result<Vec<BundleRef>, LocatorError> {
        // One page in flight at a time: the next page's identity is only
        // known once this one's response has been seen.
        let mut cursor = self.load_cursor(ctx).await?;

        loop {
            if self.is_done(&cursor) {
                return Ok(Vec::new());
            }

            let page_key = Self::page_key(&cursor);
            // A sibling locator sharing the dedup namespace may have done
            // this page already; skip it as a consumed empty page.
            if ctx.kv().exists(&self.processed_key(&page_key)).await? {
                let next = self.advanced(&cursor, None);
                self.store_cursor(ctx, &next).await?;
                cursor = next;
                continue;
            }
            if EmissionGuard::already_emitted(ctx, &self.id, &page_key).await? {
                return Ok(Vec::new());
            }

            let mut meta = MetaMap::new();
            meta.insert("locator_id".to_owned(), self.id.clone().into());
            meta.insert("page_key".to_owned(), page_key.clone().into());
            meta.insert(
                "extract_fields".to_owned(),
                serde_json::json!([
                    self.pagination.cursor_field,
                    self.pagination.total_field,
                    self.pagination.count_field,
                ]),
            );
            if !self.headers.is_empty() {
                meta.insert(
                    "headers".to_owned(),
                    serde_json::to_value(&self.headers).unwrap_or_default(),
                );
            }

            let bundle = BundleRef::new(self.page_url(&cursor)).with_meta(meta);
            EmissionGuard::mark_emitted(ctx, &self.id, &page_key).await?;
            info!(
                locator_id = %self.id,
                page = %page_key,
                "page emitted"
            );
            return Ok(vec![bundle]);
        }
    }

    async fn handle_request_processed(
        &self,
        ctx: &FetchRunContext,
        request: &RequestMeta,
        outcome: RequestOutcome,
    ) -> Result<(), LocatorError> {
        let Ok(bundle) = request.bundle() else {
            return Ok(());
        };
        if !self.owns(&bundle.meta) {
            return Ok(());
        }
        // Pages that produced a bundle advance in the completion hook;
        // discarded pages advance here so empty slices cannot wedge the
        // walk. Failed pages do not advance — they are retried on the next
        // run.
        if outcome == RequestOutcome::Discarded {
            if let Some(page_key) = bundle.meta.get("page_key").and_then(serde_json::Value::as_str)
            {
                self.consume_page(ctx, page_key, None).await?;
            }
        }
        Ok(())
    }

    async fn on_bundle_complete(
        &self,
        ctx: &FetchRunContext,
        bundle: &BundleRef,
    ) -> Result<(), LocatorError> {
        if !self.owns(&bundle.meta) {
            return Ok(());
        }
        let Some(page_key) = bundle.meta.get("page_key").and_then(serde_json::Value::as_str)
        else {
            return Ok(());
        };
        let response = bundle
            .meta
            .get("response")
            .and_then(serde_json::Value::as_object);
        self.consume_page(ctx, page_key, response).await
    }
}

impl std::fmt::Debug for PaginationHttpLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationHttpLocator")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("date_start", &self.date_start)
            .field("date_end", &self.date_end)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocfetch_core::credentials::EnvCredentialProvider;
    use ocfetch_core::error::{LoaderError, StorageError};
    use ocfetch_core::model::{AppConfig, FetcherRecipe};
    use ocfetch_core::storage::{BundleStorageContext, Storage};
    use ocfetch_core::strategy::BundleLoader;
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

    fn run_context(run_id: &str) -> Arc<FetchRunContext> {
        let app_config = Arc::new(AppConfig {
            credential_provider: Arc::new(EnvCredentialProvider::new("OCT_LOC_")),
            kv_store: Arc::new(MemoryKvStore::new()),
            storage: Arc::new(NullStorage),
        });
        Arc::new(FetchRunContext::new(run_id, app_config))
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn sirene_locator(id: &str, ctx_width: usize) -> PaginationHttpLocator {
        PaginationHttpLocator::new(
            id,
            "http://mock/siren",
            date("2024-01-15"),
            date("2024-01-15"),
            1000,
            Arc::new(TemplateQueryBuilder::new(
                "lastUpdated:[{date}T00:00:00 TO {date}T23:59:59]",
                Some("{narrowing}*".to_owned()),
            )),
            CursorPaginationSpec::default(),
            Arc::new(PrefixNarrowing::new("siren", ctx_width)),
            PaginationDirection::Forward,
        )
    }

    fn response_fields(total: u64, count: u64, next: Option<&str>) -> MetaMap {
        let mut fields = MetaMap::new();
        fields.insert("total".to_owned(), total.into());
        fields.insert("nombre".to_owned(), count.into());
        fields.insert(
            "curseurSuivant".to_owned(),
            next.map_or(serde_json::Value::Null, |t| t.into()),
        );
        fields
    }

    /// Feed one emitted page back as completed with the given response.
    async fn complete_page(
        locator: &PaginationHttpLocator,
        ctx: &FetchRunContext,
        bundle: &mut BundleRef,
        response: MetaMap,
    ) {
        bundle
            .meta
            .insert("response".to_owned(), serde_json::Value::Object(response));
        locator.on_bundle_complete(ctx, bundle).await.unwrap();
    }

    #[tokio::test]
    async fn prefix_narrowing_walks_to_terminal() {
        let narrowing = PrefixNarrowing::new("siren", 2);
        assert_eq!(narrowing.first(), "siren:00");
        assert_eq!(narrowing.next("siren:00"), "siren:01");
        assert_eq!(narrowing.next("siren:98"), "siren:99");
        assert!(narrowing.is_terminal("siren:99"));
        assert!(!narrowing.is_terminal("siren:42"));
    }

    #[tokio::test]
    async fn template_query_builder_substitutes() {
        let builder = TemplateQueryBuilder::new(
            "updated:[{date}]",
            Some("{narrowing}*".to_owned()),
        );
        assert_eq!(builder.build("2024-01-15", None), "updated:[2024-01-15]");
        assert_eq!(
            builder.build("2024-01-15", Some("siren:07")),
            "siren:07* AND updated:[2024-01-15]"
        );
    }

    #[tokio::test]
    async fn single_url_locator_emits_once_and_dedups_across_runs() {
        let ctx = run_context("run-1");
        let locator = SingleUrlHttpLocator::new(
            "single",
            vec!["https://example.com/a".to_owned(), "https://example.com/b".to_owned()],
        );

        let bundles = locator.next_bundle_refs(&ctx, 10).await.unwrap();
        assert_eq!(bundles.len(), 2);

        // Nothing new while both are in flight.
        assert!(locator.next_bundle_refs(&ctx, 10).await.unwrap().is_empty());

        // Complete the first; a restarted run must not re-emit it.
        locator.on_bundle_complete(&ctx, &bundles[0]).await.unwrap();
        let resumed = Arc::new(FetchRunContext::new("run-2", Arc::clone(&ctx.app_config)));
        let again = locator.next_bundle_refs(&resumed, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].primary_url, "https://example.com/b");
    }

    #[tokio::test]
    async fn pagination_cursor_follows_server_cursor_within_a_date() {
        let ctx = run_context("run-pg");
        let locator = sirene_locator("pg", 2);

        let bundles = locator.next_bundle_refs(&ctx, 5).await.unwrap();
        assert_eq!(bundles.len(), 1);
        let mut page1 = bundles[0].clone();
        assert!(page1.primary_url.contains("siren%3A00") || page1.primary_url.contains("siren:00"));

        // Page 1: 1000 of 1500 records, server hands the next cursor.
        complete_page(&locator, &ctx, &mut page1, response_fields(1500, 1000, Some("c-2"))).await;

        let bundles = locator.next_bundle_refs(&ctx, 5).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert!(bundles[0].primary_url.contains("curseur=c-2"));
    }

    #[tokio::test]
    async fn pagination_drains_through_narrowing_to_the_end_of_the_range() {
        let ctx = run_context("run-drain");
        // Width 1: narrowing keys siren:0 .. siren:9.
        let locator = sirene_locator("drain", 1);

        // Page 1 of siren:0.
        let mut page = locator.next_bundle_refs(&ctx, 5).await.unwrap()[0].clone();
        complete_page(&locator, &ctx, &mut page, response_fields(1500, 1000, Some("c-2"))).await;

        // Page 2 of siren:0: no further cursor.
        let mut page = locator.next_bundle_refs(&ctx, 5).await.unwrap()[0].clone();
        assert!(page.primary_url.contains("curseur=c-2"));
        complete_page(&locator, &ctx, &mut page, response_fields(1500, 500, None)).await;

        // siren:1 .. siren:9 come back empty and are discarded by the
        // loader; the locator advances through handle_request_processed.
        let mut emitted = 2;
        loop {
            let bundles = locator.next_bundle_refs(&ctx, 5).await.unwrap();
            if bundles.is_empty() {
                break;
            }
            emitted += 1;
            let request = RequestMeta::from_bundle(&bundles[0], "drain");
            locator
                .handle_request_processed(&ctx, &request, RequestOutcome::Discarded)
                .await
                .unwrap();
        }
        // 2 real pages + 9 empty narrowing slices.
        assert_eq!(emitted, 11);

        // Drained: date advanced past the end, narrowing reset.
        let cursor = locator.load_cursor(&ctx).await.unwrap();
        assert_eq!(cursor.current_date, date("2024-01-16"));
        assert_eq!(cursor.cursor_token, None);
        assert_eq!(cursor.narrowing.as_deref(), Some("siren:0"));
        assert!(locator.next_bundle_refs(&ctx, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_cap_forces_narrowing_despite_next_cursor() {
        let ctx = run_context("run-cap");
        let mut locator = sirene_locator("cap", 2);
        locator.pagination.max_records = 1000;

        let mut page = locator.next_bundle_refs(&ctx, 5).await.unwrap()[0].clone();
        // The server offers a next cursor, but the slice hit the cap.
        complete_page(&locator, &ctx, &mut page, response_fields(90_000, 1000, Some("c-2"))).await;

        let cursor = locator.load_cursor(&ctx).await.unwrap();
        assert_eq!(cursor.narrowing.as_deref(), Some("siren:01"));
        assert_eq!(cursor.cursor_token, None);
    }

    #[tokio::test]
    async fn reverse_locator_walks_dates_backwards_and_shares_dedup() {
        let ctx = run_context("run-rev");
        let forward = sirene_locator("fwd", 1);

        // The forward locator fully processes its first page.
        let mut page = forward.next_bundle_refs(&ctx, 5).await.unwrap()[0].clone();
        complete_page(&forward, &ctx, &mut page, response_fields(10, 10, None)).await;

        let reverse = PaginationHttpLocator::new(
            "rev",
            "http://mock/siren",
            date("2024-01-14"),
            date("2024-01-15"),
            1000,
            Arc::new(TemplateQueryBuilder::new(
                "lastUpdated:[{date}T00:00:00 TO {date}T23:59:59]",
                Some("{narrowing}*".to_owned()),
            )),
            CursorPaginationSpec::default(),
            Arc::new(PrefixNarrowing::new("siren", 1)),
            PaginationDirection::Reverse,
        )
        .with_dedup_prefix("fwd");

        // The reverse locator starts at the shared date; the page the
        // forward locator completed is skipped, so the first emission is
        // the next narrowing slice.
        let bundles = reverse.next_bundle_refs(&ctx, 5).await.unwrap();
        assert_eq!(bundles.len(), 1);
        let page_key = bundles[0].meta.get("page_key").and_then(serde_json::Value::as_str);
        assert_eq!(page_key, Some("2024-01-15|siren:1|-"));
    }

    #[tokio::test]
    async fn resumed_run_does_not_re_emit_inflight_page() {
        let ctx = run_context("run-resume");
        let locator = sirene_locator("resume", 2);

        let first = locator.next_bundle_refs(&ctx, 5).await.unwrap();
        assert_eq!(first.len(), 1);

        // Same run id resumes: the page is still queued, nothing new.
        let resumed = Arc::new(FetchRunContext::new(
            "run-resume",
            Arc::clone(&ctx.app_config),
        ));
        assert!(locator.next_bundle_refs(&resumed, 5).await.unwrap().is_empty());

        // A fresh run id re-emits the same (incomplete) page.
        let fresh = Arc::new(FetchRunContext::new(
            "run-fresh",
            Arc::clone(&ctx.app_config),
        ));
        let again = locator.next_bundle_refs(&fresh, 5).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].primary_url, first[0].primary_url);
    }
}
