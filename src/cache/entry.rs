use bytes::Bytes;
use serde::de::DeserializeOwned;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use super::codec;
use super::error::CodecError;

/// Longest TTL any tier or strategy accepts: ten years.
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

const END_OF_TIME: OffsetDateTime = PrimitiveDateTime::MAX.assume_utc();

/// `at + by`, pinned to the last representable instant instead of overflowing.
pub(crate) fn saturating_deadline(at: OffsetDateTime, by: std::time::Duration) -> OffsetDateTime {
    Duration::try_from(by)
        .ok()
        .and_then(|by| at.checked_add(by))
        .unwrap_or(END_OF_TIME)
}

/// A stored value plus the bookkeeping both tiers need.
///
/// Each tier owns its own copy; promoting from warm to hot clones the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Serialized JSON, gzip-compressed when `compressed` is set.
    pub data: Bytes,
    pub compressed: bool,
    pub stored_at: OffsetDateTime,
    pub ttl_seconds: u64,
    /// Hot-tier reads of this copy. Always 0 for entries read from the warm tier.
    pub access_count: u64,
}

impl CacheEntry {
    /// Time since the value was stored, never negative.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        (now - self.stored_at).max(Duration::ZERO)
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        saturating_deadline(self.stored_at, std::time::Duration::from_secs(self.ttl_seconds))
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at()
    }

    /// Whole seconds left before expiry, floored at zero.
    pub fn ttl_remaining(&self, now: OffsetDateTime) -> u64 {
        let remaining = self.expires_at() - now;
        if remaining.is_positive() {
            remaining.whole_seconds().unsigned_abs()
        } else {
            0
        }
    }

    /// Deserialize the payload into `T`, decompressing first if needed.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::decode_payload(&self.data, self.compressed)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn remaining_ttl_counts_down_and_floors_at_zero() {
        let entry = CacheEntry {
            data: Bytes::from_static(b"1"),
            compressed: false,
            stored_at: datetime!(2024-03-01 14:30 UTC),
            ttl_seconds: 60,
            access_count: 0,
        };

        assert_eq!(entry.ttl_remaining(datetime!(2024-03-01 14:30 UTC)), 60);
        assert_eq!(entry.ttl_remaining(datetime!(2024-03-01 14:30:45 UTC)), 15);
        assert!(!entry.is_expired(datetime!(2024-03-01 14:30:59 UTC)));
        assert!(entry.is_expired(datetime!(2024-03-01 14:31 UTC)));
        assert_eq!(entry.ttl_remaining(datetime!(2024-03-01 14:35 UTC)), 0);
        assert_eq!(entry.age(datetime!(2024-03-01 14:29 UTC)), Duration::ZERO);
    }

    #[test]
    fn huge_ttl_pins_expiry_to_end_of_time() {
        let entry = CacheEntry {
            data: Bytes::from_static(b"1"),
            compressed: false,
            stored_at: datetime!(2024-03-01 14:30 UTC),
            ttl_seconds: u64::MAX,
            access_count: 0,
        };

        assert_eq!(entry.expires_at(), END_OF_TIME);
        assert!(!entry.is_expired(datetime!(2124-03-01 14:30 UTC)));
        assert!(entry.ttl_remaining(datetime!(2024-03-01 14:30 UTC)) > MAX_TTL_SECONDS);
    }
}
