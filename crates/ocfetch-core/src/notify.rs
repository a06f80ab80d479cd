//! Bundle-completion notifications.
//!
//! Storage emits one [`BundleCompletionEvent`] per completed bundle. The
//! SQS publisher is the production transport; the trait exists so tests and
//! the filesystem sink can plug in their own.

use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::model::{BundleRef, MetaMap};

/// The JSON payload published when a bundle completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCompletionEvent {
    /// The bundle's BID as a string.
    pub bundle_id: String,
    /// The recipe that produced the bundle.
    pub recipe_id: String,
    /// Primary URL of the bundle.
    pub primary_url: String,
    /// Number of stored resources.
    pub resources_count: u32,
    /// Sink-assigned storage key, when the sink has one.
    #[serde(default)]
    pub storage_key: Option<String>,
    /// ISO-8601 UTC timestamp of completion.
    pub completion_timestamp: String,
    /// Completion metadata supplied by the loader.
    #[serde(default)]
    pub metadata: MetaMap,
}

impl BundleCompletionEvent {
    /// Build the event for a completed bundle.
    #[must_use]
    pub fn new(
        bundle: &BundleRef,
        recipe_id: &str,
        resources_count: u32,
        storage_key: Option<String>,
        metadata: MetaMap,
    ) -> Self {
        Self {
            bundle_id: bundle.bid.to_string(),
            recipe_id: recipe_id.to_owned(),
            primary_url: bundle.primary_url.clone(),
            resources_count,
            storage_key,
            completion_timestamp: chrono::Utc::now().to_rfc3339(),
            metadata,
        }
    }
}

/// Publishes completion events to an external queue.
#[async_trait::async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publish one event. Failures propagate — an unreachable notification
    /// queue is an operational problem, not a data problem.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Publish`] when the transport fails.
    async fn publish(&self, event: &BundleCompletionEvent) -> Result<(), NotifyError>;
}

/// SQS-backed publisher.
#[cfg(feature = "aws")]
pub struct SqsNotificationPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

#[cfg(feature = "aws")]
impl SqsNotificationPublisher {
    /// Connect to SQS. Fails construction when the queue URL is missing —
    /// a sink that requires notifications must not start without one.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::MissingQueueUrl`] when `queue_url` is unset
    /// or empty.
    pub async fn connect(
        queue_url: Option<String>,
        region: &str,
        endpoint_url: Option<&str>,
    ) -> Result<Self, NotifyError> {
        let queue_url = queue_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(NotifyError::MissingQueueUrl)?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_owned()));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Ok(Self {
            client: aws_sdk_sqs::Client::new(&config),
            queue_url,
        })
    }
}

#[cfg(feature = "aws")]
#[async_trait::async_trait]
impl NotificationPublisher for SqsNotificationPublisher {
    async fn publish(&self, event: &BundleCompletionEvent) -> Result<(), NotifyError> {
        use aws_sdk_sqs::types::MessageAttributeValue;

        let body = serde_json::to_string(event).map_err(|e| NotifyError::Publish {
            reason: format!("event serialization failed: {e}"),
        })?;

        let string_attr = |value: &str| {
            MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| NotifyError::Publish {
                    reason: format!("bad message attribute: {e}"),
                })
        };

        let response = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes("bundle_id", string_attr(&event.bundle_id)?)
            .message_attributes("recipe_id", string_attr(&event.recipe_id)?)
            .message_attributes(
                "completion_timestamp",
                string_attr(&event.completion_timestamp)?,
            )
            .send()
            .await
            .map_err(|e| NotifyError::Publish {
                reason: e.to_string(),
            })?;

        tracing::info!(
            bundle_id = %event.bundle_id,
            recipe_id = %event.recipe_id,
            message_id = response.message_id().unwrap_or(""),
            "bundle completion notification published"
        );
        Ok(())
    }
}

#[cfg(feature = "aws")]
impl std::fmt::Debug for SqsNotificationPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsNotificationPublisher")
            .field("queue_url", &self.queue_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_shape() {
        let bundle = BundleRef::new("https://example.com/data.zip");
        let mut metadata = MetaMap::new();
        metadata.insert("source".to_owned(), serde_json::json!("sftp"));

        let event = BundleCompletionEvent::new(
            &bundle,
            "us-fl",
            3,
            Some("bundle_abc".to_owned()),
            metadata,
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["bundle_id"], bundle.bid.to_string());
        assert_eq!(json["recipe_id"], "us-fl");
        assert_eq!(json["primary_url"], "https://example.com/data.zip");
        assert_eq!(json["resources_count"], 3);
        assert_eq!(json["storage_key"], "bundle_abc");
        assert_eq!(json["metadata"]["source"], "sftp");
        // RFC 3339 timestamp.
        assert!(json["completion_timestamp"].as_str().unwrap().contains('T'));
    }
}
