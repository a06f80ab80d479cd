//! Core data model: requests, bundle references, recipes, and run context.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bid::Bid;
use crate::credentials::CredentialProvider;
use crate::error::ValidationError;
use crate::storage::Storage;
use crate::strategy::{BundleLoader, BundleLocator};
use ocfetch_kv::KeyValueStore;

/// JSON object map used for advisory metadata throughout the engine.
pub type MetaMap = Map<String, Value>;

/// An opaque unit of work in the persistent queue. Immutable after enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Target URL of the request.
    pub url: String,
    /// Link depth; zero for locator-emitted requests.
    #[serde(default)]
    pub depth: u32,
    /// Optional referring URL.
    #[serde(default)]
    pub referer: Option<String>,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Engine bookkeeping (serialized bundle ref, owning locator id).
    #[serde(default)]
    pub flags: MetaMap,
}

impl RequestMeta {
    /// Build a request for a URL with no bookkeeping flags.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            depth: 0,
            referer: None,
            headers: BTreeMap::new(),
            flags: MetaMap::new(),
        }
    }

    /// Build the queue item for a locator-emitted bundle ref. The full
    /// bundle ref rides in the flags so a restarted run rebuilds the same
    /// BID instead of minting a fresh one.
    #[must_use]
    pub fn from_bundle(bundle: &BundleRef, locator_id: &str) -> Self {
        let mut flags = MetaMap::new();
        if let Ok(encoded) = serde_json::to_value(bundle) {
            flags.insert("bundle".to_owned(), encoded);
        }
        flags.insert("locator".to_owned(), Value::String(locator_id.to_owned()));

        let headers = bundle
            .meta
            .get("headers")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            url: bundle.primary_url.clone(),
            depth: 0,
            referer: None,
            headers,
            flags,
        }
    }

    /// Recover the bundle ref this request was created for.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BundleRef`] if the flags carry no decodable
    /// bundle.
    pub fn bundle(&self) -> Result<BundleRef, ValidationError> {
        let value = self
            .flags
            .get("bundle")
            .ok_or_else(|| ValidationError::BundleRef {
                reason: format!("request for '{}' carries no bundle ref", self.url),
            })?;
        serde_json::from_value(value.clone()).map_err(|e| ValidationError::BundleRef {
            reason: format!("undecodable bundle ref for '{}': {e}", self.url),
        })
    }

    /// The id of the locator that emitted this request, if recorded.
    #[must_use]
    pub fn locator_id(&self) -> Option<&str> {
        self.flags.get("locator").and_then(Value::as_str)
    }
}

/// In-memory handle to a bundle: the BID plus minimal metadata.
///
/// The `meta` map carries locator-specific hints (cursor extraction fields,
/// filename, content length). It is advisory — no engine invariant depends
/// on its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRef {
    /// Bundle identifier, minted at creation.
    pub bid: Bid,
    /// Primary URL of the bundle.
    pub primary_url: String,
    /// Number of resources the producer expects; sinks record the actual
    /// count at completion.
    #[serde(default)]
    pub resources_count: u32,
    /// Sink-assigned storage key, set after completion.
    #[serde(default)]
    pub storage_key: Option<String>,
    /// Advisory metadata.
    #[serde(default)]
    pub meta: MetaMap,
}

impl BundleRef {
    /// Create a bundle ref for a primary URL, minting a fresh BID.
    #[must_use]
    pub fn new(primary_url: impl Into<String>) -> Self {
        Self {
            bid: Bid::mint(),
            primary_url: primary_url.into(),
            resources_count: 0,
            storage_key: None,
            meta: MetaMap::new(),
        }
    }

    /// Attach advisory metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: MetaMap) -> Self {
        self.meta = meta;
        self
    }

    /// Set the expected resource count.
    #[must_use]
    pub fn with_resources_count(mut self, count: u32) -> Self {
        self.resources_count = count;
        self
    }

    /// Reject refs with an empty primary URL.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BundleRef`] when the ref is unusable.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.primary_url.trim().is_empty() {
            return Err(ValidationError::BundleRef {
                reason: format!("bundle {} has an empty primary url", self.bid),
            });
        }
        Ok(())
    }
}

/// Per-resource record stored alongside each resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Source URL of the resource.
    pub url: String,
    /// Protocol status code, when the protocol has one.
    #[serde(default)]
    pub status: Option<u16>,
    /// Content type reported by the source.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Response/attribute headers worth keeping.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Free-form note (e.g. "decompressed from gzip").
    #[serde(default)]
    pub note: Option<String>,
}

impl ResourceMeta {
    /// A minimal record for a URL.
    #[must_use]
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A fetcher assembly: ordered locators plus one loader. Immutable for the
/// duration of a run.
pub struct FetcherRecipe {
    /// Recipe identifier (e.g. `fr`, `us-fl`).
    pub recipe_id: String,
    /// Bundle locators, polled round-robin by the scheduler.
    pub locators: Vec<Arc<dyn BundleLocator>>,
    /// The loader that consumes every queued request.
    pub loader: Arc<dyn BundleLoader>,
}

impl FetcherRecipe {
    /// Start building a recipe.
    #[must_use]
    pub fn builder(recipe_id: impl Into<String>) -> FetcherRecipeBuilder {
        FetcherRecipeBuilder {
            recipe_id: recipe_id.into(),
            locators: Vec::new(),
            loader: None,
        }
    }

    /// Find a locator by id.
    #[must_use]
    pub fn locator(&self, locator_id: &str) -> Option<&Arc<dyn BundleLocator>> {
        self.locators
            .iter()
            .find(|locator| locator.locator_id() == locator_id)
    }
}

impl std::fmt::Debug for FetcherRecipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherRecipe")
            .field("recipe_id", &self.recipe_id)
            .field("locators", &self.locators.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`FetcherRecipe`].
pub struct FetcherRecipeBuilder {
    recipe_id: String,
    locators: Vec<Arc<dyn BundleLocator>>,
    loader: Option<Arc<dyn BundleLoader>>,
}

impl FetcherRecipeBuilder {
    /// Set the loader.
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn BundleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Append a locator. Order is preserved in round-robin polling.
    #[must_use]
    pub fn locator(mut self, locator: Arc<dyn BundleLocator>) -> Self {
        self.locators.push(locator);
        self
    }

    /// Build the recipe.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Field`] if no loader was set.
    pub fn build(self) -> Result<FetcherRecipe, ValidationError> {
        let loader = self.loader.ok_or_else(|| ValidationError::Field {
            field: "loader".to_owned(),
            reason: format!("recipe '{}' has no loader", self.recipe_id),
        })?;
        Ok(FetcherRecipe {
            recipe_id: self.recipe_id,
            locators: self.locators,
            loader,
        })
    }
}

/// Shared application configuration: the injected collaborators every
/// component receives through the run context.
pub struct AppConfig {
    /// Credential backend.
    pub credential_provider: Arc<dyn CredentialProvider>,
    /// Durable state substrate.
    pub kv_store: Arc<dyn KeyValueStore>,
    /// Bundle storage sink.
    pub storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig").finish_non_exhaustive()
    }
}

/// Context for one fetch run. One per run; passed to every component.
pub struct FetchRunContext {
    /// Unique run identifier, also the queue namespace suffix.
    pub run_id: String,
    /// Scratch space shared between components within the run.
    pub shared: std::sync::RwLock<MetaMap>,
    /// Injected collaborators.
    pub app_config: Arc<AppConfig>,
}

impl FetchRunContext {
    /// Create a run context.
    #[must_use]
    pub fn new(run_id: impl Into<String>, app_config: Arc<AppConfig>) -> Self {
        Self {
            run_id: run_id.into(),
            shared: std::sync::RwLock::new(MetaMap::new()),
            app_config,
        }
    }

    /// The KV store handle.
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.app_config.kv_store
    }

    /// The credential provider handle.
    #[must_use]
    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.app_config.credential_provider
    }

    /// The storage handle.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.app_config.storage
    }
}

impl std::fmt::Debug for FetchRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRunContext")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// A runnable plan: recipe, context, and worker parallelism.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    /// The recipe to execute.
    pub recipe: Arc<FetcherRecipe>,
    /// The run context.
    pub context: Arc<FetchRunContext>,
    /// Number of worker tasks. Must be at least one.
    pub concurrency: usize,
}

impl FetchPlan {
    /// Create a plan with the given concurrency.
    #[must_use]
    pub fn new(recipe: Arc<FetcherRecipe>, context: Arc<FetchRunContext>, concurrency: usize) -> Self {
        Self {
            recipe,
            context,
            concurrency,
        }
    }

    /// Validate the plan before execution.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Field`] for zero concurrency.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency == 0 {
            return Err(ValidationError::Field {
                field: "concurrency".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_meta_serde_roundtrip_with_defaults() {
        let request: RequestMeta = serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.depth, 0);
        assert!(request.referer.is_none());
        assert!(request.headers.is_empty());
        assert!(request.flags.is_empty());

        let full = RequestMeta {
            url: "https://example.com/a".to_owned(),
            depth: 2,
            referer: Some("https://example.com".to_owned()),
            headers: BTreeMap::from([("Accept".to_owned(), "application/json".to_owned())]),
            flags: MetaMap::new(),
        };
        let json = serde_json::to_string(&full).unwrap();
        let back: RequestMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, full);
    }

    #[test]
    fn bundle_rides_request_flags() {
        let mut bundle = BundleRef::new("https://example.com/page");
        bundle
            .meta
            .insert("cursor".to_owned(), Value::String("c-1".to_owned()));

        let request = RequestMeta::from_bundle(&bundle, "pages");
        assert_eq!(request.url, "https://example.com/page");
        assert_eq!(request.locator_id(), Some("pages"));

        let recovered = request.bundle().unwrap();
        assert_eq!(recovered.bid, bundle.bid);
        assert_eq!(recovered.meta, bundle.meta);
    }

    #[test]
    fn request_without_bundle_is_rejected() {
        let request = RequestMeta::new("https://example.com");
        assert!(matches!(
            request.bundle(),
            Err(ValidationError::BundleRef { .. })
        ));
    }

    #[test]
    fn bundle_headers_propagate_to_request() {
        let mut bundle = BundleRef::new("https://example.com");
        bundle.meta.insert(
            "headers".to_owned(),
            serde_json::json!({"Accept": "application/json"}),
        );
        let request = RequestMeta::from_bundle(&bundle, "single");
        assert_eq!(
            request.headers.get("Accept").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn empty_primary_url_fails_validation() {
        let bundle = BundleRef::new("  ");
        assert!(matches!(
            bundle.validate(),
            Err(ValidationError::BundleRef { .. })
        ));
    }

}
