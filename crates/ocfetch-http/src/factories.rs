//! Strategy factories for the HTTP layer.
//!
//! Registered into the core [`StrategyRegistry`] so recipes written as
//! YAML can name `http_loader`, `single_url_locator`, `pagination_locator`
//! and `reverse_pagination_locator` with plain parameter maps. Every
//! factory validates against a closed field set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ocfetch_core::error::StrategyError;
use ocfetch_core::model::MetaMap;
use ocfetch_core::registry::{
    params, StrategyFactory, StrategyInstance, StrategyKind, StrategyRegistry,
};

use crate::auth::{
    AuthenticationMechanism, BasicAuthentication, BearerTokenAuthentication, NoAuthentication,
    OAuthClientCredentials,
};
use crate::config::HttpProtocolConfig;
use crate::loader::HttpBundleLoader;
use crate::locators::{
    CursorPaginationSpec, PaginationDirection, PaginationHttpLocator, PrefixNarrowing,
    SingleUrlHttpLocator, TemplateQueryBuilder,
};
use crate::manager::HttpManager;

/// Register every HTTP strategy factory.
pub fn register_http_strategies(registry: &mut StrategyRegistry, manager: Arc<HttpManager>) {
    registry.register(
        StrategyKind::BundleLoader,
        "http_loader",
        Arc::new(HttpLoaderFactory {
            manager: Arc::clone(&manager),
        }),
    );
    registry.register(
        StrategyKind::BundleLocator,
        "single_url_locator",
        Arc::new(SingleUrlLocatorFactory),
    );
    registry.register(
        StrategyKind::BundleLocator,
        "pagination_locator",
        Arc::new(PaginationLocatorFactory {
            direction: PaginationDirection::Forward,
            strategy_name: "pagination_locator",
        }),
    );
    registry.register(
        StrategyKind::BundleLocator,
        "reverse_pagination_locator",
        Arc::new(PaginationLocatorFactory {
            direction: PaginationDirection::Reverse,
            strategy_name: "reverse_pagination_locator",
        }),
    );
}

fn headers_param(
    strategy: &str,
    params_map: &MetaMap,
    field: &str,
) -> Result<BTreeMap<String, String>, StrategyError> {
    match params_map.get(field) {
        None | Some(serde_json::Value::Null) => Ok(BTreeMap::new()),
        Some(serde_json::Value::Object(obj)) => obj
            .iter()
            .map(|(k, v)| {
                v.as_str()
                    .map(|v| (k.clone(), v.to_owned()))
                    .ok_or_else(|| StrategyError::InvalidArgument {
                        strategy: strategy.to_owned(),
                        field: field.to_owned(),
                        reason: format!("header '{k}' must be a string"),
                    })
            })
            .collect(),
        Some(_) => Err(StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: field.to_owned(),
            reason: "must be an object of strings".to_owned(),
        }),
    }
}

fn auth_param(
    strategy: &str,
    params_map: &MetaMap,
) -> Result<Arc<dyn AuthenticationMechanism>, StrategyError> {
    let Some(value) = params_map.get("auth") else {
        return Ok(Arc::new(NoAuthentication));
    };
    let Some(auth) = value.as_object() else {
        return Err(StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: "auth".to_owned(),
            reason: "must be an object".to_owned(),
        });
    };

    params::reject_unknown(strategy, auth, &["type", "config_name", "token_url"])?;
    let auth_type = params::require_str(strategy, auth, "type")?;
    match auth_type {
        "none" => Ok(Arc::new(NoAuthentication)),
        "basic" => {
            let config_name = params::require_str(strategy, auth, "config_name")?;
            Ok(Arc::new(BasicAuthentication::new(config_name)))
        }
        "bearer" => {
            let config_name = params::require_str(strategy, auth, "config_name")?;
            Ok(Arc::new(BearerTokenAuthentication::new(config_name)))
        }
        "oauth" => {
            let config_name = params::require_str(strategy, auth, "config_name")?;
            let token_url = params::require_str(strategy, auth, "token_url")?;
            Ok(Arc::new(OAuthClientCredentials::new(token_url, config_name)))
        }
        other => Err(StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: "auth.type".to_owned(),
            reason: format!("unknown mechanism '{other}'"),
        }),
    }
}

fn http_config_from(
    strategy: &str,
    params_map: &MetaMap,
) -> Result<HttpProtocolConfig, StrategyError> {
    let mut config = HttpProtocolConfig::default().with_auth(auth_param(strategy, params_map)?);
    if let Some(timeout) = params::optional_f64(strategy, params_map, "timeout_secs")? {
        config.timeout = Duration::from_secs_f64(timeout);
    }
    if let Some(rate) =
        params::optional_f64(strategy, params_map, "rate_limit_requests_per_second")?
    {
        config.rate_limit_requests_per_second = rate;
    }
    if let Some(retries) = params::optional_u64(strategy, params_map, "max_retries")? {
        config.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
    }
    for (key, value) in headers_param(strategy, params_map, "default_headers")? {
        config.default_headers.insert(key, value);
    }
    Ok(config)
}

fn date_param(strategy: &str, params_map: &MetaMap, field: &str) -> Result<NaiveDate, StrategyError> {
    params::require_str(strategy, params_map, field)?
        .parse()
        .map_err(|_| StrategyError::InvalidArgument {
            strategy: strategy.to_owned(),
            field: field.to_owned(),
            reason: "must be a YYYY-MM-DD date".to_owned(),
        })
}

/// Builds [`HttpBundleLoader`] instances over a shared manager.
pub struct HttpLoaderFactory {
    manager: Arc<HttpManager>,
}

const HTTP_LOADER_FIELDS: &[&str] = &[
    "meta_load_name",
    "timeout_secs",
    "rate_limit_requests_per_second",
    "max_retries",
    "default_headers",
    "auth",
];

impl StrategyFactory for HttpLoaderFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("http_loader", params_map, HTTP_LOADER_FIELDS)?;
        params::require_str("http_loader", params_map, "meta_load_name")?;
        http_config_from("http_loader", params_map)?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let meta_load_name = params::require_str("http_loader", params_map, "meta_load_name")?;
        let config = http_config_from("http_loader", params_map)?;
        Ok(StrategyInstance::Loader(Arc::new(HttpBundleLoader::new(
            Arc::clone(&self.manager),
            config,
            meta_load_name,
        ))))
    }
}

/// Builds [`SingleUrlHttpLocator`] instances.
pub struct SingleUrlLocatorFactory;

const SINGLE_URL_FIELDS: &[&str] = &["id", "urls", "headers"];

impl StrategyFactory for SingleUrlLocatorFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown("single_url_locator", params_map, SINGLE_URL_FIELDS)?;
        params::require_str("single_url_locator", params_map, "id")?;
        params::optional_str_list("single_url_locator", params_map, "urls")?.ok_or_else(|| {
            StrategyError::InvalidArgument {
                strategy: "single_url_locator".to_owned(),
                field: "urls".to_owned(),
                reason: "missing required field".to_owned(),
            }
        })?;
        headers_param("single_url_locator", params_map, "headers")?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let id = params::require_str("single_url_locator", params_map, "id")?;
        let urls = params::optional_str_list("single_url_locator", params_map, "urls")?
            .unwrap_or_default();
        let headers = headers_param("single_url_locator", params_map, "headers")?;
        Ok(StrategyInstance::Locator(Arc::new(
            SingleUrlHttpLocator::new(id, urls).with_headers(headers),
        )))
    }
}

/// Builds forward and reverse [`PaginationHttpLocator`] instances.
pub struct PaginationLocatorFactory {
    direction: PaginationDirection,
    strategy_name: &'static str,
}

const PAGINATION_FIELDS: &[&str] = &[
    "id",
    "base_url",
    "date_start",
    "date_end",
    "max_records_per_page",
    "headers",
    "query_template",
    "narrowing_template",
    "narrowing_field",
    "narrowing_width",
    "cursor_field",
    "total_field",
    "count_field",
    "max_records",
    "query_param",
    "page_size_param",
    "cursor_param",
    "dedup_prefix",
];

impl PaginationLocatorFactory {
    fn pagination_spec(&self, params_map: &MetaMap) -> Result<CursorPaginationSpec, StrategyError> {
        let mut spec = CursorPaginationSpec::default();
        if let Some(field) = params::optional_str(self.strategy_name, params_map, "cursor_field")? {
            spec.cursor_field = field.to_owned();
        }
        if let Some(field) = params::optional_str(self.strategy_name, params_map, "total_field")? {
            spec.total_field = field.to_owned();
        }
        if let Some(field) = params::optional_str(self.strategy_name, params_map, "count_field")? {
            spec.count_field = field.to_owned();
        }
        if let Some(max) = params::optional_u64(self.strategy_name, params_map, "max_records")? {
            spec.max_records = max;
        }
        if let Some(param) = params::optional_str(self.strategy_name, params_map, "query_param")? {
            spec.query_param = param.to_owned();
        }
        if let Some(param) =
            params::optional_str(self.strategy_name, params_map, "page_size_param")?
        {
            spec.page_size_param = param.to_owned();
        }
        if let Some(param) = params::optional_str(self.strategy_name, params_map, "cursor_param")? {
            spec.cursor_param = param.to_owned();
        }
        Ok(spec)
    }
}

impl StrategyFactory for PaginationLocatorFactory {
    fn validate(&self, params_map: &MetaMap) -> Result<(), StrategyError> {
        params::reject_unknown(self.strategy_name, params_map, PAGINATION_FIELDS)?;
        params::require_str(self.strategy_name, params_map, "id")?;
        params::require_str(self.strategy_name, params_map, "base_url")?;
        params::require_str(self.strategy_name, params_map, "query_template")?;
        date_param(self.strategy_name, params_map, "date_start")?;
        date_param(self.strategy_name, params_map, "date_end")?;
        headers_param(self.strategy_name, params_map, "headers")?;
        self.pagination_spec(params_map)?;
        Ok(())
    }

    fn create(
        &self,
        params_map: &MetaMap,
        _registry: &StrategyRegistry,
    ) -> Result<StrategyInstance, StrategyError> {
        let id = params::require_str(self.strategy_name, params_map, "id")?;
        let base_url = params::require_str(self.strategy_name, params_map, "base_url")?;
        let date_start = date_param(self.strategy_name, params_map, "date_start")?;
        let date_end = date_param(self.strategy_name, params_map, "date_end")?;
        let max_per_page =
            params::optional_u64(self.strategy_name, params_map, "max_records_per_page")?
                .unwrap_or(1000);
        let query_template = params::require_str(self.strategy_name, params_map, "query_template")?;
        let narrowing_template =
            params::optional_str(self.strategy_name, params_map, "narrowing_template")?
                .map(str::to_owned);
        let narrowing_field =
            params::optional_str(self.strategy_name, params_map, "narrowing_field")?
                .unwrap_or("prefix");
        let narrowing_width =
            params::optional_u64(self.strategy_name, params_map, "narrowing_width")?.unwrap_or(2);
        let headers = headers_param(self.strategy_name, params_map, "headers")?;

        let mut locator = PaginationHttpLocator::new(
            id,
            base_url,
            date_start,
            date_end,
            u32::try_from(max_per_page).unwrap_or(u32::MAX),
            Arc::new(TemplateQueryBuilder::new(query_template, narrowing_template)),
            self.pagination_spec(params_map)?,
            Arc::new(PrefixNarrowing::new(
                narrowing_field,
                usize::try_from(narrowing_width).unwrap_or(2),
            )),
            self.direction,
        )
        .with_headers(headers);

        if let Some(prefix) = params::optional_str(self.strategy_name, params_map, "dedup_prefix")?
        {
            locator = locator.with_dedup_prefix(prefix);
        }
        Ok(StrategyInstance::Locator(Arc::new(locator)))
    }
}
