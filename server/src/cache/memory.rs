//! In-process cache backend for development and tests.
//!
//! Sharing one `MemoryBackend` between several `DistributedCache` instances
//! models a multi-node deployment: entries live in the shared map and the
//! broadcast channel plays the fan-out bus.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::CacheBackend;

pub struct MemoryBackend {
    entries: DashMap<String, (String, Instant)>,
    fanout: broadcast::Sender<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            fanout,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn publish(&self, payload: &str) -> anyhow::Result<()> {
        // No subscribers is fine; single-node deployments have none.
        let _ = self.fanout.send(payload.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.fanout.subscribe()
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_expiry() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Duration::from_millis(10)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let backend = MemoryBackend::new();
        let mut rx = backend.subscribe();
        backend.publish("hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
