//! Remote key-value backing tier.
//!
//! Values are the UTF-8 JSON envelopes produced by
//! [`codec::to_warm_value`](super::codec::to_warm_value); backends never look
//! inside them. Every backend error is a [`WarmTierError`] that the store
//! downgrades to a miss or a skipped write.

mod memory;
mod redis_tier;

use std::time::Duration;

use async_trait::async_trait;

use super::error::WarmTierError;

pub use memory::MemoryWarmTier;
pub use redis_tier::RedisWarmTier;

#[async_trait]
pub trait WarmTier: Send + Sync {
    /// Short backend name for logs and metric labels.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, WarmTierError>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), WarmTierError>;

    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, WarmTierError>;

    /// Delete every key matching a glob-style `pattern` (`*`, `?`, `[...]`).
    async fn delete_matching(&self, pattern: &str) -> Result<u64, WarmTierError>;
}

/// Warm tier that stores nothing: every read misses, every write succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledWarmTier;

#[async_trait]
impl WarmTier for DisabledWarmTier {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, WarmTierError> {
        Ok(None)
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), WarmTierError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool, WarmTierError> {
        Ok(false)
    }

    async fn delete_matching(&self, _pattern: &str) -> Result<u64, WarmTierError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_tier_always_misses() {
        let warm = DisabledWarmTier;
        warm.set_ex("k", "v".into(), Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(warm.get("k").await.expect("get"), None);
        assert!(!warm.delete("k").await.expect("delete"));
        assert_eq!(warm.delete_matching("*").await.expect("clear"), 0);
    }
}
