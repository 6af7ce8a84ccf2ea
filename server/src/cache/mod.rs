//! Distributed cache with cross-node invalidation fan-out.
//!
//! A namespaced mapping from string key to a JSON-typed value. Each node
//! keeps a moka near-cache in front of the shared backend; every write or
//! delete publishes a small envelope on the fan-out channel so peers drop
//! their near-cache entries. The cache is best-effort everywhere: backend
//! failures are logged at `warn` and never surface to callers.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Upper bound on how long a near-cache entry may outlive its last write,
/// regardless of the entry's own TTL.
const NEAR_CACHE_TTL: Duration = Duration::from_secs(30);
const NEAR_CACHE_CAPACITY: u64 = 10_000;

/// Envelope published on the fan-out channel for every write or delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEnvelope {
    pub key: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub ts: i64,
}

/// What actually lands in the backend: the value plus its absolute expiry,
/// so a near-cache populated from a backend read still honors the TTL.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    v: serde_json::Value,
    #[serde(rename = "exp")]
    expires_at_ms: i64,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn publish(&self, payload: &str) -> anyhow::Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<String>;
    async fn dispose(&self) -> anyhow::Result<()>;
}

type InvalidateHandler = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
struct NearEntry {
    value: serde_json::Value,
    expires_at_ms: i64,
}

pub struct DistributedCache {
    node_id: String,
    namespace: String,
    near: moka::sync::Cache<String, NearEntry>,
    backend: Arc<dyn CacheBackend>,
    handlers: Arc<RwLock<Vec<InvalidateHandler>>>,
    subscriber: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DistributedCache {
    pub fn new(namespace: &str, backend: Arc<dyn CacheBackend>) -> Arc<Self> {
        let node_id = ulid::Ulid::new().to_string();
        let near = moka::sync::Cache::builder()
            .max_capacity(NEAR_CACHE_CAPACITY)
            .time_to_live(NEAR_CACHE_TTL)
            .build();
        let handlers: Arc<RwLock<Vec<InvalidateHandler>>> = Arc::new(RwLock::new(Vec::new()));

        let cache = Arc::new(Self {
            node_id: node_id.clone(),
            namespace: namespace.to_string(),
            near: near.clone(),
            backend: backend.clone(),
            handlers: handlers.clone(),
            subscriber: parking_lot::Mutex::new(None),
        });

        let mut rx = backend.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        // Malformed envelopes are dropped; the subscriber
                        // must never die on bad input.
                        let Ok(envelope) =
                            serde_json::from_str::<InvalidationEnvelope>(&payload)
                        else {
                            tracing::debug!("ignoring malformed invalidation envelope");
                            continue;
                        };
                        if envelope.node_id == node_id {
                            continue;
                        }
                        metrics::counter!("cache_invalidations_total", 1);
                        near.invalidate(&envelope.key);
                        for handler in handlers.read().iter() {
                            handler(&envelope.key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "invalidation subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *cache.subscriber.lock() = Some(task);
        cache
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Read through: near-cache first, then the shared backend. Stale
    /// entries are never served. Backend failure reads as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get_checked(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %crate::redact::for_log(key), error = %e, "cache get failed");
                None
            }
        }
    }

    /// Like [`get`](Self::get) but surfaces backend unavailability, for the
    /// few callers (the rate limiter) that need to know they are flying
    /// without the shared state.
    pub async fn get_checked<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        let full_key = self.full_key(key);
        let now_ms = Utc::now().timestamp_millis();

        if let Some(entry) = self.near.get(&full_key) {
            if entry.expires_at_ms > now_ms {
                metrics::counter!("cache_near_hits_total", 1);
                return Ok(serde_json::from_value(entry.value).ok());
            }
            self.near.invalidate(&full_key);
        }

        let Some(raw) = self.backend.get(&full_key).await? else {
            return Ok(None);
        };
        let Ok(stored) = serde_json::from_str::<StoredEntry>(&raw) else {
            return Ok(None);
        };
        if stored.expires_at_ms <= now_ms {
            return Ok(None);
        }

        self.near.insert(
            full_key,
            NearEntry {
                value: stored.v.clone(),
                expires_at_ms: stored.expires_at_ms,
            },
        );
        metrics::counter!("cache_shared_hits_total", 1);
        Ok(serde_json::from_value(stored.v).ok())
    }

    /// Write-through with absolute TTL, then publish the invalidation so
    /// peers drop their near-cache copies. Best-effort on every leg.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let full_key = self.full_key(key);
        let Ok(json) = serde_json::to_value(value) else {
            tracing::warn!(key = %crate::redact::for_log(key), "cache set: unserializable value");
            return;
        };
        let expires_at_ms = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let stored = StoredEntry {
            v: json.clone(),
            expires_at_ms,
        };

        match serde_json::to_string(&stored) {
            Ok(raw) => {
                if let Err(e) = self.backend.set(&full_key, &raw, ttl).await {
                    tracing::warn!(key = %crate::redact::for_log(key), error = %e, "cache set failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache set: encode failed");
                return;
            }
        }

        self.near.insert(
            full_key.clone(),
            NearEntry {
                value: json,
                expires_at_ms,
            },
        );
        self.publish_invalidation(&full_key).await;
    }

    pub async fn delete(&self, key: &str) {
        let full_key = self.full_key(key);
        if let Err(e) = self.backend.delete(&full_key).await {
            tracing::warn!(key = %crate::redact::for_log(key), error = %e, "cache delete failed");
        }
        self.near.invalidate(&full_key);
        self.publish_invalidation(&full_key).await;
    }

    /// Register a handler invoked for every peer invalidation.
    pub fn on_invalidate(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    pub async fn dispose(&self) {
        if let Some(task) = self.subscriber.lock().take() {
            task.abort();
        }
        if let Err(e) = self.backend.dispose().await {
            tracing::warn!(error = %e, "cache backend dispose failed");
        }
    }

    async fn publish_invalidation(&self, full_key: &str) {
        let envelope = InvalidationEnvelope {
            key: full_key.to_string(),
            node_id: self.node_id.clone(),
            ts: Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "invalidation encode failed");
                return;
            }
        };
        if let Err(e) = self.backend.publish(&payload).await {
            tracing::warn!(error = %e, "invalidation publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn two_nodes() -> (Arc<DistributedCache>, Arc<DistributedCache>) {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        (
            DistributedCache::new("test", backend.clone()),
            DistributedCache::new("test", backend),
        )
    }

    #[tokio::test]
    async fn read_through_and_near_cache() {
        let (node_a, node_b) = two_nodes();
        node_a
            .set("conv:c1", &"metadata".to_string(), Duration::from_secs(60))
            .await;

        // Node B reads through the shared backend.
        let value: Option<String> = node_b.get("conv:c1").await;
        assert_eq!(value.as_deref(), Some("metadata"));
        // Second read hits B's near cache.
        let value: Option<String> = node_b.get("conv:c1").await;
        assert_eq!(value.as_deref(), Some("metadata"));
    }

    #[tokio::test]
    async fn delete_invalidates_peer_near_caches() {
        let (node_a, node_b) = two_nodes();
        node_a
            .set("conv:c2", &42u32, Duration::from_secs(60))
            .await;
        assert_eq!(node_b.get::<u32>("conv:c2").await, Some(42));

        node_a.delete("conv:c2").await;
        // One fan-out round-trip.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node_b.get::<u32>("conv:c2").await, None);
    }

    #[tokio::test]
    async fn self_invalidations_are_suppressed() {
        let (node_a, _node_b) = two_nodes();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        node_a.on_invalidate(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        node_a.set("k", &1u8, Duration::from_secs(5)).await;
        node_a.delete("k").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn peer_invalidations_reach_handlers() {
        let (node_a, node_b) = two_nodes();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        node_b.on_invalidate(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        node_a.set("k", &1u8, Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_envelopes_are_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let node = DistributedCache::new("test", backend.clone() as Arc<dyn CacheBackend>);
        node.set("k", &7u8, Duration::from_secs(5)).await;

        backend.publish("{not json").await.unwrap();
        backend.publish("[1,2,3]").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Subscriber survived and the entry is still served.
        assert_eq!(node.get::<u8>("k").await, Some(7));
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        let (node_a, _) = two_nodes();
        node_a.set("k", &1u8, Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node_a.get::<u8>("k").await, None);
    }
}
