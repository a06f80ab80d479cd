//! AWS Secrets Manager credential backend.
//!
//! Secrets are named `<config_name>-sftp-credentials` and hold a JSON map
//! of keys (`username`, `password`, `host`, `consumer_key`, ...). Lookups
//! are cached per `(secret, key)` for the lifetime of the provider;
//! `clear()` drops the cache.

use std::collections::HashMap;
use std::sync::Mutex;

use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::error::SdkError;
use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;
use tracing::debug;

use super::CredentialProvider;
use crate::error::CredentialError;

/// Credential provider backed by AWS Secrets Manager.
pub struct SecretsManagerCredentialProvider {
    client: aws_sdk_secretsmanager::Client,
    cache: Mutex<HashMap<String, String>>,
}

impl SecretsManagerCredentialProvider {
    /// Connect using the ambient AWS credential chain (`AWS_PROFILE`,
    /// instance roles, env keys). `endpoint_url` overrides the service
    /// endpoint for localstack testing.
    pub async fn connect(region: &str, endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_owned()));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: aws_sdk_secretsmanager::Client::new(&config),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn secret_name(config_name: &str) -> String {
        format!("{config_name}-sftp-credentials")
    }
}

#[async_trait::async_trait]
impl CredentialProvider for SecretsManagerCredentialProvider {
    async fn get_credential(
        &self,
        config_name: &str,
        key: &str,
    ) -> Result<String, CredentialError> {
        let secret_name = Self::secret_name(config_name);
        let cache_key = format!("{secret_name}:{key}");

        if let Ok(cache) = self.cache.lock() {
            if let Some(value) = cache.get(&cache_key) {
                return Ok(value.clone());
            }
        }

        let response = self
            .client
            .get_secret_value()
            .secret_id(&secret_name)
            .send()
            .await
            .map_err(|err| match &err {
                SdkError::ServiceError(service) => match service.err() {
                    GetSecretValueError::ResourceNotFoundException(_) => {
                        CredentialError::KeyMissing {
                            name: secret_name.clone(),
                        }
                    }
                    _ if service.err().to_string().contains("AccessDenied") => {
                        CredentialError::AccessDenied {
                            name: secret_name.clone(),
                        }
                    }
                    other => CredentialError::Backend {
                        reason: other.to_string(),
                    },
                },
                other => CredentialError::Backend {
                    reason: other.to_string(),
                },
            })?;

        let payload = response
            .secret_string()
            .ok_or_else(|| CredentialError::Backend {
                reason: format!("secret '{secret_name}' has no string payload"),
            })?;

        let map: HashMap<String, serde_json::Value> =
            serde_json::from_str(payload).map_err(|e| CredentialError::Backend {
                reason: format!("secret '{secret_name}' is not valid JSON: {e}"),
            })?;

        let value = map
            .get(key)
            .ok_or_else(|| CredentialError::KeyMissing {
                name: format!("{secret_name}:{key}"),
            })?
            .as_str()
            .ok_or_else(|| CredentialError::Backend {
                reason: format!("key '{key}' in secret '{secret_name}' is not a string"),
            })?
            .to_owned();

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(cache_key, value.clone());
        }

        debug!(secret = %secret_name, key, "credential resolved");
        Ok(value)
    }

    fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

impl std::fmt::Debug for SecretsManagerCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManagerCredentialProvider")
            .finish_non_exhaustive()
    }
}
