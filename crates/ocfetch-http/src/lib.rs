//! HTTP protocol layer for `ocfetch`.
//!
//! Per-config client pools with a rate-limit gate and retry, header-level
//! authentication mechanisms (None / Basic / Bearer / OAuth client
//! credentials), the streaming HTTP bundle loader, and the API locators
//! (single URL, date-sliced cursor pagination, reverse pagination).

pub mod auth;
pub mod config;
pub mod error;
pub mod factories;
pub mod loader;
pub mod locators;
pub mod manager;
pub mod pool;

pub use auth::{
    AuthenticationMechanism, BasicAuthentication, BearerTokenAuthentication, Headers,
    NoAuthentication, OAuthClientCredentials,
};
pub use config::HttpProtocolConfig;
pub use error::HttpError;
pub use loader::{HttpBundleLoader, TrackingHttpBundleLoader};
pub use locators::{
    CursorPaginationSpec, NarrowingStrategy, PaginationDirection, PaginationHttpLocator,
    PrefixNarrowing, QueryBuilder, SingleUrlHttpLocator, TemplateQueryBuilder,
};
pub use manager::HttpManager;
pub use pool::HttpConnectionPool;
