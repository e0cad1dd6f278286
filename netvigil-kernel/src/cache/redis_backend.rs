/*!
 * BACKEND REDIS - Connexion multiplexée + abonnements pub/sub dédiés
 *
 * Une seule connexion multiplexée partagée pour les commandes. Pas de file
 * d'attente hors-ligne : tant que `connect` n'a pas réussi, chaque commande
 * échoue immédiatement avec `CacheError::Disconnected`.
 */

use super::backend::CacheBackend;
use super::{CacheError, ChannelMessage};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const SUBSCRIPTION_BUFFER: usize = 256;

pub struct RedisBackend {
    client: redis::Client,
    url: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self { client, url: url.to_string(), conn: Mutex::new(None) })
    }

    fn conn(&self) -> Result<MultiplexedConnection, CacheError> {
        self.conn.lock().clone().ok_or(CacheError::Disconnected)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn connect(&self) -> Result<(), CacheError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.conn.lock() = Some(conn);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn()?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn()?;
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn mset(&self, entries: Vec<(String, String)>, ttl: Option<Duration>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("MSET").arg(&entries).ignore();
        if let Some(ttl) = ttl {
            for (key, _) in &entries {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn()?;
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CacheError> {
        let mut conn = self.conn()?;
        let receivers: usize = redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut conn).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<ChannelMessage>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("[cache] undecodable message on {}: {e}", msg.get_channel_name());
                        continue;
                    }
                };
                let message = ChannelMessage { channel: msg.get_channel_name().to_string(), payload };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!("[cache] redis subscription closed");
        });
        Ok(rx)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
