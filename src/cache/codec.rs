//! Payload encoding for both tiers.
//!
//! Values travel as UTF-8 JSON. Large payloads are gzip-compressed, but only
//! when that actually pays off. The warm tier stores entries inside a small
//! JSON envelope:
//!
//! ```json
//! {"compressed": true, "data": "<base64 gzip>", "storedAt": 1709303400000, "ttlSeconds": 60}
//! ```
//!
//! When `compressed` is false, `data` holds the JSON text itself.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::entry::{CacheEntry, MAX_TTL_SECONDS};
use super::error::CodecError;

const NANOS_PER_MILLI: i128 = 1_000_000;

/// When to spend CPU on compression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionPolicy {
    /// Payloads at or below this size are never compressed.
    pub threshold_bytes: usize,
    /// Keep the compressed form only if it is at most this fraction of the original.
    pub max_ratio: f64,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            max_ratio: 0.8,
        }
    }
}

/// A value ready to be written to a tier.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub bytes: Bytes,
    pub compressed: bool,
    /// Size of the uncompressed JSON.
    pub raw_len: usize,
    /// Top-level element count, used by the hot-tier admission heuristic.
    pub elements: usize,
}

pub fn encode_payload(
    value: &Value,
    policy: &CompressionPolicy,
) -> Result<EncodedPayload, CodecError> {
    let raw = serde_json::to_vec(value)?;
    let raw_len = raw.len();
    let elements = element_count(value);

    if raw_len > policy.threshold_bytes {
        let packed = compress(&raw)?;
        if packed.len() as f64 <= raw_len as f64 * policy.max_ratio {
            return Ok(EncodedPayload {
                bytes: Bytes::from(packed),
                compressed: true,
                raw_len,
                elements,
            });
        }
    }

    Ok(EncodedPayload {
        bytes: Bytes::from(raw),
        compressed: false,
        raw_len,
        elements,
    })
}

pub fn decode_payload<T: DeserializeOwned>(data: &[u8], compressed: bool) -> Result<T, CodecError> {
    if compressed {
        let raw = decompress(data)?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(data)?)
    }
}

pub fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

pub fn decompress(packed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(packed);
    let mut raw = Vec::with_capacity(packed.len() * 2);
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

/// Number of items a value carries at its top level: array length, object
/// key count, or 1 for scalars.
pub fn element_count(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::Object(fields) => fields.len(),
        _ => 1,
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WarmEnvelope {
    compressed: bool,
    data: String,
    stored_at: i64,
    ttl_seconds: u64,
}

/// Render an entry as the warm tier's JSON envelope.
pub fn to_warm_value(entry: &CacheEntry) -> Result<String, CodecError> {
    let data = if entry.compressed {
        BASE64.encode(&entry.data)
    } else {
        String::from_utf8(entry.data.to_vec())?
    };

    let envelope = WarmEnvelope {
        compressed: entry.compressed,
        data,
        stored_at: (entry.stored_at.unix_timestamp_nanos() / NANOS_PER_MILLI) as i64,
        ttl_seconds: entry.ttl_seconds,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse a warm-tier envelope back into an entry with a zero access count.
pub fn from_warm_value(text: &str) -> Result<CacheEntry, CodecError> {
    let envelope: WarmEnvelope = serde_json::from_str(text)?;
    if envelope.ttl_seconds > MAX_TTL_SECONDS {
        return Err(CodecError::TtlOutOfRange(envelope.ttl_seconds));
    }
    let data = if envelope.compressed {
        Bytes::from(BASE64.decode(envelope.data.as_bytes())?)
    } else {
        Bytes::from(envelope.data.into_bytes())
    };
    let stored_at =
        OffsetDateTime::from_unix_timestamp_nanos(envelope.stored_at as i128 * NANOS_PER_MILLI)?;

    Ok(CacheEntry {
        data,
        compressed: envelope.compressed,
        stored_at,
        ttl_seconds: envelope.ttl_seconds,
        access_count: 0,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn repetitive_quotes(count: usize) -> Value {
        let rows: Vec<Value> = (0..count)
            .map(|i| json!({"symbol": "AAPL", "price": 187.25, "volume": 1_000, "seq": i}))
            .collect();
        Value::Array(rows)
    }

    /// Deterministic bytes with no repetition gzip can exploit.
    fn noisy_text(len: usize) -> String {
        let mut state: u32 = 0x9E37_79B9;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                char::from(b'!' + (state % 90) as u8)
            })
            .filter(|c| *c != '"' && *c != '\\')
            .collect()
    }

    #[test]
    fn small_payloads_stay_raw() {
        let value = json!({"symbol": "AAPL", "price": 187.25});
        let encoded = encode_payload(&value, &CompressionPolicy::default()).expect("encode");

        assert!(!encoded.compressed);
        assert_eq!(encoded.elements, 2);
        assert_eq!(encoded.bytes.len(), encoded.raw_len);
        let back: Value = decode_payload(&encoded.bytes, encoded.compressed).expect("decode");
        assert_eq!(back, value);
    }

    #[test]
    fn large_repetitive_payloads_are_compressed_and_restored() {
        let value = repetitive_quotes(200);
        let encoded = encode_payload(&value, &CompressionPolicy::default()).expect("encode");

        assert!(encoded.compressed);
        assert!((encoded.bytes.len() as f64) <= encoded.raw_len as f64 * 0.8);
        assert_eq!(encoded.elements, 200);
        let back: Value = decode_payload(&encoded.bytes, true).expect("decode");
        assert_eq!(back, value);
    }

    #[test]
    fn compression_skipped_when_savings_too_small() {
        let value = Value::String(noisy_text(4096));
        let policy = CompressionPolicy {
            threshold_bytes: 1024,
            max_ratio: 0.3,
        };
        let encoded = encode_payload(&value, &policy).expect("encode");

        assert!(encoded.raw_len > policy.threshold_bytes);
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes.len(), encoded.raw_len);
    }

    #[test]
    fn compress_then_decompress_is_identity() {
        for input in [
            Vec::new(),
            b"x".to_vec(),
            noisy_text(3000).into_bytes(),
            serde_json::to_vec(&repetitive_quotes(50)).expect("json"),
        ] {
            let packed = compress(&input).expect("compress");
            assert_eq!(decompress(&packed).expect("decompress"), input);
        }
    }

    #[test]
    fn warm_envelope_preserves_entry() {
        let stored_at = datetime!(2024-03-01 14:30:00.123 UTC);
        for value in [json!({"bid": 1.0841, "ask": 1.0843}), repetitive_quotes(100)] {
            let encoded = encode_payload(&value, &CompressionPolicy::default()).expect("encode");
            let entry = CacheEntry {
                data: encoded.bytes,
                compressed: encoded.compressed,
                stored_at,
                ttl_seconds: 45,
                access_count: 9,
            };

            let text = to_warm_value(&entry).expect("envelope");
            let parsed = from_warm_value(&text).expect("parse envelope");

            assert_eq!(parsed.stored_at, stored_at);
            assert_eq!(parsed.ttl_seconds, 45);
            assert_eq!(parsed.compressed, entry.compressed);
            assert_eq!(parsed.access_count, 0);
            assert_eq!(parsed.decode::<Value>().expect("decode"), value);
        }
    }

    #[test]
    fn uncompressed_envelope_keeps_json_readable() {
        let value = json!({"symbol": "MSFT"});
        let encoded = encode_payload(&value, &CompressionPolicy::default()).expect("encode");
        let entry = CacheEntry {
            data: encoded.bytes,
            compressed: false,
            stored_at: datetime!(2024-03-01 14:30 UTC),
            ttl_seconds: 10,
            access_count: 0,
        };

        let envelope: Value =
            serde_json::from_str(&to_warm_value(&entry).expect("envelope")).expect("json");
        assert_eq!(envelope["compressed"], json!(false));
        assert_eq!(envelope["data"], json!(r#"{"symbol":"MSFT"}"#));
        assert_eq!(envelope["ttlSeconds"], json!(10));
    }

    #[test]
    fn garbage_envelope_is_an_error() {
        assert!(from_warm_value("not json").is_err());
        assert!(
            from_warm_value(r#"{"compressed":true,"data":"@@@","storedAt":0,"ttlSeconds":1}"#)
                .is_err()
        );
    }

    #[test]
    fn envelope_ttl_beyond_ceiling_is_rejected() {
        let err = from_warm_value(
            r#"{"compressed":false,"data":"1","storedAt":0,"ttlSeconds":18446744073709551615}"#,
        )
        .expect_err("ttl too large");
        assert!(matches!(err, CodecError::TtlOutOfRange(u64::MAX)));

        let at_ceiling = format!(
            r#"{{"compressed":false,"data":"1","storedAt":0,"ttlSeconds":{MAX_TTL_SECONDS}}}"#
        );
        assert!(from_warm_value(&at_ceiling).is_ok());
    }
}
