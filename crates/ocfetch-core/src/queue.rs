//! Persistent FIFO work queue over the key-value substrate.
//!
//! Items are stored one per key under `<namespace>:<suffix>` where the
//! suffix is a zero-padded millisecond timestamp plus a per-queue counter.
//! Key order is therefore enqueue order for a single producer, and ordering
//! survives restarts because time moves forward. Dequeue is a range scan
//! followed by per-key deletes; losing a delete race to another worker just
//! means skipping that key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ocfetch_kv::{Codec, KeyValueStore};
use tracing::warn;

use crate::error::QueueError;
use crate::model::RequestMeta;

/// A persistent request queue namespaced per run.
pub struct KvRequestQueue {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
    codec: Codec,
    counter: AtomicU64,
}

impl KvRequestQueue {
    /// Create a queue over `kv` with the given namespace
    /// (conventionally `fetch:<run_id>:queue`).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidNamespace`] for an empty namespace.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        codec: Codec,
    ) -> Result<Self, QueueError> {
        let namespace = namespace.into();
        if namespace.trim().is_empty() {
            return Err(QueueError::InvalidNamespace {
                reason: "namespace must be a non-empty string".to_owned(),
            });
        }
        Ok(Self {
            kv,
            namespace,
            codec,
            counter: AtomicU64::new(0),
        })
    }

    fn range_start(&self) -> String {
        format!("{}:", self.namespace)
    }

    fn range_end(&self) -> String {
        // char::MAX sorts after every byte a key suffix can contain, so the
        // half-open range covers exactly this namespace.
        format!("{}:{}", self.namespace, char::MAX)
    }

    fn next_key(&self) -> String {
        #[allow(clippy::cast_sign_loss)]
        let millis = chrono::Utc::now().timestamp_millis() as u64;
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}:{millis:016x}-{seq:08x}", self.namespace)
    }

    /// Enqueue items in order. Returns the number written. A failure midway
    /// leaves earlier items enqueued (at-least-once).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if a write fails; items written before
    /// the failure stay in the queue.
    pub async fn enqueue(&self, items: &[RequestMeta]) -> Result<usize, QueueError> {
        let mut written = 0;
        for item in items {
            let bytes = self.codec.dumps(item)?;
            self.kv.put(&self.next_key(), &bytes, None).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Dequeue up to `max_items` oldest items, removing them atomically per
    /// key. Items another worker removed first are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the scan or a decode fails.
    pub async fn dequeue(&self, max_items: usize) -> Result<Vec<RequestMeta>, QueueError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        // Scan a little past max_items so racing workers still fill their
        // batch; rescan until the batch is full or the namespace is empty.
        let scan_limit = max_items.saturating_mul(2);
        while items.len() < max_items {
            let entries = self
                .kv
                .range_get(&self.range_start(), Some(&self.range_end()), Some(scan_limit))
                .await?;
            if entries.is_empty() {
                break;
            }
            for (key, value) in entries {
                if items.len() >= max_items {
                    break;
                }
                // delete() returning false means another worker won this key.
                if !self.kv.delete(&key).await? {
                    continue;
                }
                match self.codec.loads::<RequestMeta>(&value) {
                    Ok(item) => items.push(item),
                    Err(err) => {
                        warn!(key = %key, error = %err, "undecodable queue item");
                        return Err(QueueError::Store(err));
                    }
                }
            }
        }
        Ok(items)
    }

    /// Look at the oldest items without removing them.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the scan or a decode fails.
    pub async fn peek(&self, max_items: usize) -> Result<Vec<RequestMeta>, QueueError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let entries = self
            .kv
            .range_get(&self.range_start(), Some(&self.range_end()), Some(max_items))
            .await?;
        entries
            .into_iter()
            .map(|(_, value)| self.codec.loads::<RequestMeta>(&value).map_err(QueueError::Store))
            .collect()
    }

    /// Number of items currently queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the scan fails.
    pub async fn size(&self) -> Result<usize, QueueError> {
        let entries = self
            .kv
            .range_get(&self.range_start(), Some(&self.range_end()), None)
            .await?;
        Ok(entries.len())
    }

    /// Remove every item in the namespace. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the scan or a delete fails.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let entries = self
            .kv
            .range_get(&self.range_start(), Some(&self.range_end()), None)
            .await?;
        let mut removed = 0;
        for (key, _) in entries {
            if self.kv.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Release the queue. The underlying store stays open — it is owned by
    /// the application config, not the queue.
    pub async fn close(&self) {}
}

impl std::fmt::Debug for KvRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvRequestQueue")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocfetch_kv::MemoryKvStore;

    fn queue_over(kv: &Arc<dyn KeyValueStore>, namespace: &str) -> KvRequestQueue {
        KvRequestQueue::new(Arc::clone(kv), namespace, Codec::Json).unwrap()
    }

    fn request(url: &str) -> RequestMeta {
        RequestMeta::new(url)
    }

    fn memory_kv() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryKvStore::new())
    }

    #[tokio::test]
    async fn enqueue_dequeue_roundtrip() {
        let kv = memory_kv();
        let queue = queue_over(&kv, "test_queue");

        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.enqueue(&[request("https://example.com")]).await.unwrap(), 1);
        assert_eq!(queue.size().await.unwrap(), 1);

        let peeked = queue.peek(1).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].url, "https://example.com");
        assert_eq!(queue.size().await.unwrap(), 1);

        let items = queue.dequeue(1).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://example.com");
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let kv = memory_kv();
        let queue = queue_over(&kv, "fifo");

        let items: Vec<RequestMeta> = (0..5)
            .map(|i| request(&format!("https://example.com/{i}")))
            .collect();
        assert_eq!(queue.enqueue(&items).await.unwrap(), 5);

        let mut seen = Vec::new();
        while let Some(item) = queue.dequeue(1).await.unwrap().pop() {
            seen.push(item.url);
        }
        let expected: Vec<String> = (0..5).map(|i| format!("https://example.com/{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn dequeue_batches_and_drains() {
        let kv = memory_kv();
        let queue = queue_over(&kv, "batch");
        let items: Vec<RequestMeta> = (0..5)
            .map(|i| request(&format!("https://example.com/{i}")))
            .collect();
        queue.enqueue(&items).await.unwrap();

        assert_eq!(queue.dequeue(3).await.unwrap().len(), 3);
        assert_eq!(queue.size().await.unwrap(), 2);
        assert_eq!(queue.dequeue(10).await.unwrap().len(), 2);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_queue_operations() {
        let kv = memory_kv();
        let queue = queue_over(&kv, "empty");

        assert!(queue.dequeue(1).await.unwrap().is_empty());
        assert!(queue.peek(1).await.unwrap().is_empty());
        assert_eq!(queue.enqueue(&[]).await.unwrap(), 0);
        assert!(queue.dequeue(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let kv = memory_kv();
        let queue = queue_over(&kv, "clear");
        let items: Vec<RequestMeta> = (0..3)
            .map(|i| request(&format!("https://example.com/{i}")))
            .collect();
        queue.enqueue(&items).await.unwrap();

        assert_eq!(queue.clear().await.unwrap(), 3);
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let kv = memory_kv();
        let queue1 = queue_over(&kv, "ns1");
        let queue2 = queue_over(&kv, "ns2");

        queue1.enqueue(&[request("https://queue1.example")]).await.unwrap();
        assert_eq!(queue1.size().await.unwrap(), 1);
        assert_eq!(queue2.size().await.unwrap(), 0);

        queue2.enqueue(&[request("https://queue2.example")]).await.unwrap();
        let items = queue1.dequeue(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://queue1.example");
        assert_eq!(queue2.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_dequeuers_split_the_queue() {
        let kv = memory_kv();
        let queue = Arc::new(queue_over(&kv, "race"));
        let items: Vec<RequestMeta> = (0..10)
            .map(|i| request(&format!("https://example.com/{i}")))
            .collect();
        queue.enqueue(&items).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.dequeue(2).await.map(|items| items.len())
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap().unwrap();
        }
        assert_eq!(total, 10);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_namespace_rejected() {
        let kv = memory_kv();
        let err = KvRequestQueue::new(Arc::clone(&kv), "", Codec::Json).unwrap_err();
        assert!(matches!(err, QueueError::InvalidNamespace { .. }));
    }
}
