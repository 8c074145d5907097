use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::info;

use crate::{
    cache::{Clock, DisabledWarmTier, MemoryWarmTier, RedisWarmTier, WarmTier, WarmTierError},
    config::{WarmBackend, WarmTierSettings},
};

use super::error::InfraError;

const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Build the warm tier selected by configuration.
///
/// Redis is connected eagerly so a bad URL fails at startup rather than on
/// the first cache miss.
pub async fn build_warm_tier(
    settings: &WarmTierSettings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn WarmTier>, InfraError> {
    let tier: Arc<dyn WarmTier> = match &settings.backend {
        WarmBackend::Memory => Arc::new(MemoryWarmTier::new(clock)),
        WarmBackend::Disabled => Arc::new(DisabledWarmTier),
        WarmBackend::Redis { url } => {
            let connect_timeout = settings.io_timeout.max(MIN_CONNECT_TIMEOUT);
            let connected = timeout(
                connect_timeout,
                RedisWarmTier::connect(url, settings.key_prefix.clone()),
            )
            .await
            .map_err(|_| InfraError::WarmTier {
                backend: "redis",
                source: WarmTierError::Timeout {
                    op: "connect",
                    timeout: connect_timeout,
                },
            })?
            .map_err(|source| InfraError::WarmTier {
                backend: "redis",
                source,
            })?;
            Arc::new(connected)
        }
    };

    info!(backend = tier.name(), "Warm tier ready");
    Ok(tier)
}
