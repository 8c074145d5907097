//! Error types for the caching core.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::strategy::CacheStrategy;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure reported by a caller-supplied fetch function.
///
/// The cache never inspects it; on a synchronous miss it is handed back to
/// the caller untouched inside [`CacheError::Fetch`].
pub struct FetchError {
    inner: BoxError,
}

impl FetchError {
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self {
            inner: error.into(),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message.into())
    }

    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// Errors surfaced by [`CacheOrchestrator`](super::CacheOrchestrator).
///
/// Warm-tier trouble never shows up here; the store downgrades it to a miss
/// or a skipped write.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(FetchError),
    #[error("fetch for `{key}` timed out after {timeout:?}")]
    FetchTimeout { key: String, timeout: Duration },
    #[error("fetched value for `{key}` could not be serialized: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid key pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Payload encoding and decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload compression failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("compressed payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("uncompressed payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("envelope timestamp out of range: {0}")]
    Timestamp(#[from] time::error::ComponentRange),
    #[error("envelope ttl of {0}s is beyond the supported ceiling")]
    TtlOutOfRange(u64),
}

/// Failures talking to the remote warm tier.
#[derive(Debug, Error)]
pub enum WarmTierError {
    #[error("warm tier connection failed: {0}")]
    Connection(String),
    #[error("warm tier `{op}` timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("warm tier backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for WarmTierError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Invalid strategy parameters, detected when the table is validated.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("strategy `{strategy}` has invalid `{field}`: {reason}")]
pub struct StrategyConfigError {
    pub strategy: CacheStrategy,
    pub field: &'static str,
    pub reason: String,
}

impl StrategyConfigError {
    pub(crate) fn new(
        strategy: CacheStrategy,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            strategy,
            field,
            reason: reason.into(),
        }
    }
}

/// Invalid runtime limits for the cache as a whole.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheConfigError {
    #[error(transparent)]
    Strategy(#[from] StrategyConfigError),
    #[error("invalid cache setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl CacheConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
