//! HTTP bundle loader.
//!
//! Downloads a request's primary URL and drives the bundle storage
//! lifecycle: start, stream the response body as the primary resource,
//! complete. Responses can be rejected before bundle start by an error
//! handler (5xx/403/404 are discarded by default). When the emitting
//! locator asked for field extraction (`extract_fields` in the bundle
//! meta), the body is buffered, parsed as JSON, and the named top-level
//! fields are copied into the bundle meta under `response` — that is how
//! pagination locators learn the server-provided next cursor.

use std::collections::HashSet;
use std::sync::Arc;

use ocfetch_core::error::LoaderError;
use ocfetch_core::model::{BundleRef, FetchRunContext, FetcherRecipe, MetaMap, RequestMeta, ResourceMeta};
use ocfetch_core::storage::{resource_name_for_url, Storage};
use ocfetch_core::strategy::BundleLoader;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::auth::Headers;
use crate::config::HttpProtocolConfig;
use crate::error::HttpError;
use crate::manager::HttpManager;

/// Decides whether a response status is worth a bundle. Returning `false`
/// discards the response before bundle start.
pub type ErrorHandler = Arc<dyn Fn(&str, u16) -> bool + Send + Sync>;

fn default_discard(status: u16) -> bool {
    status >= 500 || status == 403 || status == 404
}

/// Generic HTTP API loader.
pub struct HttpBundleLoader {
    manager: Arc<HttpManager>,
    config: HttpProtocolConfig,
    meta_load_name: String,
    error_handler: Option<ErrorHandler>,
}

impl HttpBundleLoader {
    /// Create a loader over a shared manager.
    #[must_use]
    pub fn new(
        manager: Arc<HttpManager>,
        config: HttpProtocolConfig,
        meta_load_name: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            config,
            meta_load_name: meta_load_name.into(),
            error_handler: None,
        }
    }

    /// Install a custom error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    fn should_keep(&self, url: &str, status: u16) -> bool {
        match &self.error_handler {
            Some(handler) => handler(url, status),
            None => !default_discard(status),
        }
    }

    async fn load_inner(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn Storage>,
        ctx: &Arc<FetchRunContext>,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>, HttpError> {
        // Rebuild the locator's bundle ref (same BID across retries and
        // restarts); requests enqueued outside a locator get a fresh one.
        let mut bundle = request
            .bundle()
            .unwrap_or_else(|_| BundleRef::new(request.url.clone()));

        let headers: Headers = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let response = self
            .manager
            .request(
                &self.config,
                ctx.credentials(),
                reqwest::Method::GET,
                &request.url,
                &headers,
            )
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                if let Some(status) = err.status() {
                    if !self.should_keep(&request.url, status) {
                        warn!(
                            url = %request.url,
                            status,
                            loader = %self.meta_load_name,
                            "response discarded after retries"
                        );
                        return Ok(Vec::new());
                    }
                }
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() && !self.should_keep(&request.url, status) {
            warn!(
                url = %request.url,
                status,
                loader = %self.meta_load_name,
                "response discarded"
            );
            return Ok(Vec::new());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        bundle.meta.insert("status_code".to_owned(), status.into());
        if let Some(content_type) = &content_type {
            bundle
                .meta
                .insert("content_type".to_owned(), content_type.clone().into());
        }

        let mut resource_meta = ResourceMeta::for_url(request.url.clone());
        resource_meta.status = Some(status);
        resource_meta.content_type = content_type;

        // Field extraction requires the whole body; plain downloads stream.
        let extract_fields: Vec<String> = bundle
            .meta
            .get("extract_fields")
            .and_then(serde_json::Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let resource_name = resource_name_for_url(&request.url);

        if extract_fields.is_empty() {
            let stream = response.bytes_stream();
            let reader = StreamReader::new(futures::TryStreamExt::map_err(stream, |e| {
                std::io::Error::other(e.to_string())
            }));

            let context = storage
                .start_bundle(bundle.clone(), Arc::clone(recipe), Arc::clone(ctx))
                .await
                .map_err(|e| HttpError::Request {
                    url: request.url.clone(),
                    reason: e.to_string(),
                })?;
            context
                .add_resource(&resource_name, resource_meta, Box::new(reader))
                .await
                .map_err(|e| HttpError::Request {
                    url: request.url.clone(),
                    reason: e.to_string(),
                })?;
            self.complete(&context, ctx).await?;
        } else {
            let body = response.bytes().await.map_err(|e| HttpError::Request {
                url: request.url.clone(),
                reason: e.to_string(),
            })?;

            if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) {
                let mut extracted = MetaMap::new();
                for field in &extract_fields {
                    if let Some(value) = parsed.get(field) {
                        extracted.insert(field.clone(), value.clone());
                    }
                }
                bundle
                    .meta
                    .insert("response".to_owned(), serde_json::Value::Object(extracted));
            }

            let context = storage
                .start_bundle(bundle.clone(), Arc::clone(recipe), Arc::clone(ctx))
                .await
                .map_err(|e| HttpError::Request {
                    url: request.url.clone(),
                    reason: e.to_string(),
                })?;
            context
                .add_resource(
                    &resource_name,
                    resource_meta,
                    Box::new(std::io::Cursor::new(body.to_vec())),
                )
                .await
                .map_err(|e| HttpError::Request {
                    url: request.url.clone(),
                    reason: e.to_string(),
                })?;
            self.complete(&context, ctx).await?;
            // The completion hooks read the extracted fields off this ref.
            return Ok(vec![context.bundle().clone()]);
        }

        debug!(
            url = %request.url,
            bid = %bundle.bid,
            loader = %self.meta_load_name,
            "bundle loaded"
        );
        Ok(vec![bundle])
    }

    async fn complete(
        &self,
        context: &Arc<ocfetch_core::storage::BundleStorageContext>,
        ctx: &Arc<FetchRunContext>,
    ) -> Result<(), HttpError> {
        let mut metadata = MetaMap::new();
        metadata.insert("source".to_owned(), "http_api".into());
        metadata.insert("run_id".to_owned(), ctx.run_id.clone().into());
        metadata.insert("loader".to_owned(), self.meta_load_name.clone().into());
        context
            .complete(metadata)
            .await
            .map_err(|e| HttpError::Request {
                url: context.bundle().primary_url.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl BundleLoader for HttpBundleLoader {
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
                // Per-request failures consume the request without raising;
                // the scheduler records nothing here, the locator's
                // bookkeeping sees a discard.
                warn!(
                    url = %request.url,
                    loader = %self.meta_load_name,
                    error = %err,
                    "request load failed"
                );
                Ok(Vec::new())
            }
        }
    }
}

impl std::fmt::Debug for HttpBundleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBundleLoader")
            .field("meta_load_name", &self.meta_load_name)
            .finish_non_exhaustive()
    }
}

/// [`HttpBundleLoader`] that remembers which requests failed, so recipes
/// can feed them into a follow-up locator.
pub struct TrackingHttpBundleLoader {
    inner: HttpBundleLoader,
    failed: std::sync::Mutex<HashSet<String>>,
}

impl TrackingHttpBundleLoader {
    /// Wrap a loader with failure tracking.
    #[must_use]
    pub fn new(inner: HttpBundleLoader) -> Self {
        Self {
            inner,
            failed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// URLs whose loads produced no bundle so far.
    #[must_use]
    pub fn failed_urls(&self) -> Vec<String> {
        self.failed
            .lock()
            .map(|failed| failed.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl BundleLoader for TrackingHttpBundleLoader {
    async fn load(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn Storage>,
        ctx: &Arc<FetchRunContext>,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>, LoaderError> {
        let bundles = self.inner.load(request, storage, ctx, recipe).await?;
        if bundles.is_empty() {
            if let Ok(mut failed) = self.failed.lock() {
                failed.insert(request.url.clone());
            }
        }
        Ok(bundles)
    }
}

impl std::fmt::Debug for TrackingHttpBundleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingHttpBundleLoader")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocfetch_core::credentials::EnvCredentialProvider;
    use ocfetch_core::model::AppConfig;
    use ocfetch_core::storage::FileStorage;
    use ocfetch_kv::MemoryKvStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recipe(loader: Arc<dyn BundleLoader>) -> Arc<FetcherRecipe> {
        Arc::new(
            FetcherRecipe::builder("http-test")
                .loader(loader)
                .build()
                .unwrap(),
        )
    }

    fn run_context(root: &std::path::Path) -> (Arc<FetchRunContext>, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::builder(root).build().unwrap());
        let app_config = Arc::new(AppConfig {
            credential_provider: Arc::new(EnvCredentialProvider::new("OCT_LOADER_")),
            kv_store: Arc::new(MemoryKvStore::new()),
            storage: Arc::clone(&storage),
        });
        (
            Arc::new(FetchRunContext::new("run-loader", app_config)),
            storage,
        )
    }

    fn loader_for_test(manager: &Arc<HttpManager>) -> HttpBundleLoader {
        let config = HttpProtocolConfig {
            rate_limit_requests_per_second: 1000.0,
            max_retries: 0,
            ..HttpProtocolConfig::default()
        };
        HttpBundleLoader::new(Arc::clone(manager), config, "test_loader")
    }

    #[tokio::test]
    async fn streams_body_into_a_completed_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/data.csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("a,b\n1,2\n")
                    .insert_header("content-type", "text/csv"),
            )
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let (ctx, storage) = run_context(root.path());
        let manager = Arc::new(HttpManager::new());
        let loader = Arc::new(loader_for_test(&manager));
        let recipe = recipe(Arc::clone(&loader) as Arc<dyn BundleLoader>);

        let bundle = BundleRef::new(format!("{}/files/data.csv", server.uri()));
        let request = RequestMeta::from_bundle(&bundle, "test");

        let bundles = loader.load(&request, &storage, &ctx, &recipe).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].bid, bundle.bid);

        let dir = root.path().join(format!("bundle_{}", bundle.bid));
        assert_eq!(
            std::fs::read(dir.join("data.csv")).unwrap(),
            b"a,b\n1,2\n".to_vec()
        );
        assert!(dir.join("bundle.meta").exists());
    }

    #[tokio::test]
    async fn extracts_requested_fields_from_json_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/siren"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": 1500,
                "nombre": 1000,
                "curseurSuivant": "c-2",
                "items": [1, 2, 3],
            })))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let (ctx, storage) = run_context(root.path());
        let manager = Arc::new(HttpManager::new());
        let loader = Arc::new(loader_for_test(&manager));
        let recipe = recipe(Arc::clone(&loader) as Arc<dyn BundleLoader>);

        let mut bundle = BundleRef::new(format!("{}/siren", server.uri()));
        bundle.meta.insert(
            "extract_fields".to_owned(),
            serde_json::json!(["curseurSuivant", "total", "nombre"]),
        );
        let request = RequestMeta::from_bundle(&bundle, "test");

        let bundles = loader.load(&request, &storage, &ctx, &recipe).await.unwrap();
        assert_eq!(bundles.len(), 1);
        let response = bundles[0].meta.get("response").unwrap();
        assert_eq!(response["curseurSuivant"], "c-2");
        assert_eq!(response["total"], 1500);
        assert_eq!(response["nombre"], 1000);
    }

    #[tokio::test]
    async fn not_found_is_discarded_without_a_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let (ctx, storage) = run_context(root.path());
        let manager = Arc::new(HttpManager::new());
        let loader = Arc::new(loader_for_test(&manager));
        let recipe = recipe(Arc::clone(&loader) as Arc<dyn BundleLoader>);

        let bundle = BundleRef::new(format!("{}/gone", server.uri()));
        let request = RequestMeta::from_bundle(&bundle, "test");

        let bundles = loader.load(&request, &storage, &ctx, &recipe).await.unwrap();
        assert!(bundles.is_empty());
        // No bundle directory was created.
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn custom_error_handler_overrides_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/teapot"))
            .respond_with(ResponseTemplate::new(418).set_body_string("short and stout"))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let (ctx, storage) = run_context(root.path());
        let manager = Arc::new(HttpManager::new());
        // Keep nothing that is not a 200.
        let loader = Arc::new(
            loader_for_test(&manager)
                .with_error_handler(Arc::new(|_url, status| status == 200)),
        );
        let recipe = recipe(Arc::clone(&loader) as Arc<dyn BundleLoader>);

        let bundle = BundleRef::new(format!("{}/teapot", server.uri()));
        let request = RequestMeta::from_bundle(&bundle, "test");

        let bundles = loader.load(&request, &storage, &ctx, &recipe).await.unwrap();
        assert!(bundles.is_empty());
    }

    #[tokio::test]
    async fn tracking_loader_records_failed_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let (ctx, storage) = run_context(root.path());
        let manager = Arc::new(HttpManager::new());
        let tracking = Arc::new(TrackingHttpBundleLoader::new(loader_for_test(&manager)));
        let recipe = recipe(Arc::clone(&tracking) as Arc<dyn BundleLoader>);

        let url = format!("{}/gone", server.uri());
        let bundle = BundleRef::new(url.clone());
        let request = RequestMeta::from_bundle(&bundle, "test");

        tracking.load(&request, &storage, &ctx, &recipe).await.unwrap();
        assert_eq!(tracking.failed_urls(), vec![url]);
    }
}
