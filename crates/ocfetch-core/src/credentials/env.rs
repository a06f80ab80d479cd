//! Environment-variable credential backend.
//!
//! Maps `(config_name, key)` to `<prefix><CONFIG_NAME>_<KEY>` with dashes
//! replaced by underscores and everything uppercased — `("us-fl",
//! "username")` with the default prefix reads `OC_CREDENTIAL_US_FL_USERNAME`.
//! Intended for development and CI, where secrets arrive via the process
//! environment.

use std::sync::Mutex;

use super::CredentialProvider;
use crate::error::CredentialError;

/// Credential provider that reads environment variables.
#[derive(Debug, Default)]
pub struct EnvCredentialProvider {
    prefix: String,
    /// Variables asked for so far, kept to produce a complete "set these"
    /// message when one is missing.
    requested: Mutex<Vec<String>>,
}

impl EnvCredentialProvider {
    /// Create a provider with the given variable-name prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Mangle `(config_name, key)` into a variable name.
    #[must_use]
    pub fn variable_name(&self, config_name: &str, key: &str) -> String {
        format!(
            "{}{}_{}",
            self.prefix,
            config_name.to_uppercase().replace('-', "_"),
            key.to_uppercase().replace('-', "_")
        )
    }

    /// Variables requested so far that are still unset.
    #[must_use]
    pub fn missing_variables(&self) -> Vec<String> {
        self.requested
            .lock()
            .map(|requested| {
                requested
                    .iter()
                    .filter(|name| std::env::var(name).is_err())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credential(
        &self,
        config_name: &str,
        key: &str,
    ) -> Result<String, CredentialError> {
        let name = self.variable_name(config_name, key);

        if let Ok(mut requested) = self.requested.lock() {
            if !requested.contains(&name) {
                requested.push(name.clone());
            }
        }

        std::env::var(&name).map_err(|_| {
            let missing = self.missing_variables();
            let mut reason = name.clone();
            if missing.len() > 1 {
                reason.push_str(" (also missing: ");
                reason.push_str(&missing.join(", "));
                reason.push(')');
            }
            CredentialError::KeyMissing { name: reason }
        })
    }

    fn clear(&self) {
        if let Ok(mut requested) = self.requested.lock() {
            requested.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_name_mangling() {
        let provider = EnvCredentialProvider::new("OC_CREDENTIAL_");
        assert_eq!(
            provider.variable_name("us-fl", "username"),
            "OC_CREDENTIAL_US_FL_USERNAME"
        );
        assert_eq!(provider.variable_name("fr", "consumer_key"), "OC_CREDENTIAL_FR_CONSUMER_KEY");
    }

    #[tokio::test]
    async fn reads_value_from_environment() {
        // Unique prefix per test to avoid cross-test interference.
        std::env::set_var("OCT_ENVTEST_FR_TOKEN", "sekrit");
        let provider = EnvCredentialProvider::new("OCT_ENVTEST_");

        let value = provider.get_credential("fr", "token").await.unwrap();
        assert_eq!(value, "sekrit");
        std::env::remove_var("OCT_ENVTEST_FR_TOKEN");
    }

    #[tokio::test]
    async fn missing_variable_is_key_missing() {
        let provider = EnvCredentialProvider::new("OCT_MISSING_");
        let err = provider.get_credential("us-fl", "password").await.unwrap_err();
        match err {
            CredentialError::KeyMissing { name } => {
                assert!(name.contains("OCT_MISSING_US_FL_PASSWORD"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn clear_resets_requested_tracking() {
        let provider = EnvCredentialProvider::new("OCT_CLEAR_");
        let _ = provider.get_credential("a", "b").await;
        assert_eq!(provider.missing_variables().len(), 1);
        provider.clear();
        assert!(provider.missing_variables().is_empty());
    }
}
