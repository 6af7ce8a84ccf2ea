//! Redis cache backend.
//!
//! One long-lived command connection (`ConnectionManager`) plus one pub/sub
//! subscriber task per process. The subscriber forwards raw channel payloads
//! into a broadcast sender; envelope parsing and self-suppression happen in
//! the `DistributedCache` layer. A dropped pub/sub connection is retried
//! with a short delay.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::CacheBackend;

const INVALIDATION_CHANNEL: &str = "courier:cache:invalidate";
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub struct RedisBackend {
    manager: ConnectionManager,
    fanout: broadcast::Sender<String>,
    subscriber: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        let (fanout, _) = broadcast::channel(256);

        let tx = fanout.clone();
        let subscriber = tokio::spawn(async move {
            loop {
                match client.get_async_connection().await {
                    Ok(conn) => {
                        let mut pubsub = conn.into_pubsub();
                        if let Err(e) = pubsub.subscribe(INVALIDATION_CHANNEL).await {
                            tracing::warn!(error = %e, "pubsub subscribe failed");
                        } else {
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                match msg.get_payload::<String>() {
                                    Ok(payload) => {
                                        let _ = tx.send(payload);
                                    }
                                    Err(e) => {
                                        tracing::debug!(error = %e, "unreadable pubsub payload");
                                    }
                                }
                            }
                            tracing::warn!("pubsub stream ended, reconnecting");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "pubsub connection failed");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });

        Ok(Self {
            manager,
            fanout,
            subscriber: parking_lot::Mutex::new(Some(subscriber)),
        })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PUBLISH")
            .arg(INVALIDATION_CHANNEL)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.fanout.subscribe()
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        if let Some(task) = self.subscriber.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
