//! Credential resolution.
//!
//! Everything that needs a secret — SFTP passwords, OAuth client keys,
//! bearer tokens — asks a [`CredentialProvider`] for `(config_name, key)`
//! and gets a string back. Two backends are provided: environment variables
//! for development, and AWS Secrets Manager (feature `aws`) for production.

mod env;

#[cfg(feature = "aws")]
mod aws;

pub use env::EnvCredentialProvider;

#[cfg(feature = "aws")]
pub use aws::SecretsManagerCredentialProvider;

use crate::error::{ConfigError, CredentialError};

/// Resolves `(config_name, key)` pairs to secret strings.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch one credential value.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::KeyMissing`] when the key does not exist,
    /// [`CredentialError::AccessDenied`] when the backend refuses access,
    /// and [`CredentialError::Backend`] for transport or decode failures.
    async fn get_credential(
        &self,
        config_name: &str,
        key: &str,
    ) -> Result<String, CredentialError>;

    /// Invalidate any cached lookups.
    fn clear(&self);
}

/// Which credential backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialProviderKind {
    /// AWS Secrets Manager.
    Aws,
    /// Environment variables.
    Environment,
}

impl CredentialProviderKind {
    /// Parse a provider selector (`aws` or `env`/`environment`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownVariant`] for anything else.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "env" | "environment" => Ok(Self::Environment),
            other => Err(ConfigError::UnknownVariant {
                setting: "credential provider type".to_owned(),
                value: other.to_owned(),
            }),
        }
    }
}

/// Settings for [`create_credential_provider`]. Unset fields fall back to
/// the `OC_CREDENTIAL_PROVIDER_*` environment and then to defaults.
#[derive(Debug, Clone, Default)]
pub struct CredentialSettings {
    /// Backend selector. Env: `OC_CREDENTIAL_PROVIDER_TYPE` (default `aws`).
    pub provider_type: Option<String>,
    /// AWS region. Env: `AWS_REGION` then
    /// `OC_CREDENTIAL_PROVIDER_AWS_REGION` (default `eu-west-2`).
    pub aws_region: Option<String>,
    /// AWS endpoint override for localstack testing.
    /// Env: `OC_CREDENTIAL_PROVIDER_AWS_ENDPOINT_URL`.
    pub aws_endpoint_url: Option<String>,
    /// Env-var name prefix for the environment backend.
    /// Env: `OC_CREDENTIAL_PROVIDER_ENV_PREFIX` (default `OC_CREDENTIAL_`).
    pub env_prefix: Option<String>,
}

/// Build a credential provider from settings and environment.
///
/// # Errors
///
/// Returns [`ConfigError`] for unknown provider types, or when the `aws`
/// backend is requested in a build without the `aws` feature.
pub async fn create_credential_provider(
    settings: &CredentialSettings,
) -> Result<std::sync::Arc<dyn CredentialProvider>, ConfigError> {
    let provider_type = settings
        .provider_type
        .clone()
        .or_else(|| std::env::var("OC_CREDENTIAL_PROVIDER_TYPE").ok())
        .unwrap_or_else(|| "aws".to_owned());

    match CredentialProviderKind::parse(&provider_type)? {
        CredentialProviderKind::Environment => {
            let prefix = settings
                .env_prefix
                .clone()
                .or_else(|| std::env::var("OC_CREDENTIAL_PROVIDER_ENV_PREFIX").ok())
                .unwrap_or_else(|| "OC_CREDENTIAL_".to_owned());
            Ok(std::sync::Arc::new(EnvCredentialProvider::new(prefix)))
        }
        #[cfg(feature = "aws")]
        CredentialProviderKind::Aws => {
            let region = settings
                .aws_region
                .clone()
                .or_else(|| std::env::var("AWS_REGION").ok())
                .or_else(|| std::env::var("OC_CREDENTIAL_PROVIDER_AWS_REGION").ok())
                .unwrap_or_else(|| "eu-west-2".to_owned());
            let endpoint_url = settings
                .aws_endpoint_url
                .clone()
                .or_else(|| std::env::var("OC_CREDENTIAL_PROVIDER_AWS_ENDPOINT_URL").ok());
            Ok(std::sync::Arc::new(
                SecretsManagerCredentialProvider::connect(&region, endpoint_url.as_deref()).await,
            ))
        }
        #[cfg(not(feature = "aws"))]
        CredentialProviderKind::Aws => Err(ConfigError::Invalid {
            name: "credential provider type".to_owned(),
            reason: "this build does not include the 'aws' feature".to_owned(),
        }),
    }
}
