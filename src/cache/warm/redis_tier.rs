use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::WarmTier;
use crate::cache::error::WarmTierError;

const SCAN_BATCH: usize = 100;

/// Redis-backed warm tier. Keys are namespaced with `key_prefix`.
#[derive(Clone)]
pub struct RedisWarmTier {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisWarmTier {
    /// Open a managed connection; reconnects are handled by the manager.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, WarmTierError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected warm tier to redis");

        Ok(Self {
            manager,
            key_prefix: key_prefix.into(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl WarmTier for RedisWarmTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, WarmTierError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(self.full_key(key)).await?)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), WarmTierError> {
        let mut conn = self.manager.clone();
        // SET EX rejects 0.
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.full_key(key), value, seconds)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, WarmTierError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = conn.del(self.full_key(key)).await?;
        Ok(deleted > 0)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, WarmTierError> {
        let mut conn = self.manager.clone();
        let full_pattern = self.full_key(pattern);
        let mut cursor: u64 = 0;
        let mut total_deleted = 0u64;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: i64 = conn.del(&keys).await?;
                total_deleted += deleted.max(0) as u64;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }
}
