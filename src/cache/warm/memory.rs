use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use glob::Pattern;
use time::OffsetDateTime;

use super::WarmTier;
use crate::cache::clock::Clock;
use crate::cache::entry::saturating_deadline;
use crate::cache::error::WarmTierError;

/// In-process stand-in for a remote store. Honours TTLs against the
/// injected clock, so tests can expire entries without sleeping.
pub struct MemoryWarmTier {
    clock: Arc<dyn Clock>,
    entries: DashMap<String, (String, OffsetDateTime)>,
}

impl MemoryWarmTier {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    /// Live entries; expired ones are not counted.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|item| item.value().1 > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WarmTier for MemoryWarmTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, WarmTierError> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(item) if item.value().1 > now => return Ok(Some(item.value().0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), WarmTierError> {
        let expires = saturating_deadline(self.clock.now(), ttl);
        self.entries.insert(key.to_owned(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, WarmTierError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, WarmTierError> {
        let pattern = Pattern::new(pattern)
            .map_err(|err| WarmTierError::Backend(format!("invalid pattern `{pattern}`: {err}")))?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        Ok((before - self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::cache::clock::ManualClock;

    fn tier() -> (Arc<ManualClock>, MemoryWarmTier) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 14:30 UTC)));
        let warm = MemoryWarmTier::new(clock.clone());
        (clock, warm)
    }

    #[tokio::test]
    async fn entries_expire_on_the_injected_clock() {
        let (clock, warm) = tier();
        warm.set_ex("k", "v".into(), Duration::from_secs(30))
            .await
            .expect("set");

        clock.advance(Duration::from_secs(29));
        assert_eq!(warm.get("k").await.expect("get").as_deref(), Some("v"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(warm.get("k").await.expect("get"), None);
        assert!(warm.is_empty());
    }

    #[tokio::test]
    async fn delete_matching_follows_glob_rules() {
        let (_clock, warm) = tier();
        for key in ["md:adaptive:AAPL", "md:adaptive:MSFT", "fx:adaptive:EURUSD"] {
            warm.set_ex(key, "v".into(), Duration::from_secs(60))
                .await
                .expect("set");
        }

        assert_eq!(warm.delete_matching("md:*").await.expect("clear"), 2);
        assert_eq!(warm.len(), 1);
        assert!(warm.delete("fx:adaptive:EURUSD").await.expect("delete"));
        assert!(!warm.delete("fx:adaptive:EURUSD").await.expect("delete"));
    }
}
