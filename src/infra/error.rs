use thiserror::Error;

use crate::cache::WarmTierError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("warm tier `{backend}` unavailable: {source}")]
    WarmTier {
        backend: &'static str,
        #[source]
        source: WarmTierError,
    },
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::time::Duration;

    use super::*;

    #[test]
    fn warm_tier_error_keeps_backend_and_cause() {
        let err = InfraError::WarmTier {
            backend: "redis",
            source: WarmTierError::Timeout {
                op: "connect",
                timeout: Duration::from_secs(1),
            },
        };

        assert!(err.to_string().starts_with("warm tier `redis` unavailable"));
        assert!(err.source().is_some());
    }
}
