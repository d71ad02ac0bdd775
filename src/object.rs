//! Typed, expiring, integrity-checked cache entries
//!
//! A [`CacheObject`] carries one value, an optional absolute UTC expiry,
//! and a persistence flag. Its on-disk form is a small JSON record holding
//! the value, the expiry as fractional epoch seconds, a type tag for
//! reconstruction, and a truncated SHA-256 digest over the canonical
//! string form. The digest serves two purposes: skipping redundant writes
//! and detecting tampering or corruption on reload - a record whose
//! recomputed digest mismatches the stored one is discarded, never
//! surfaced.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::error::{Result, StoreError};

/// Number of digest hex characters stored in a record
const HASH_LENGTH: usize = 6;

/// Timezone-aware timestamps: microseconds and a `+HHMM` style offset
const AWARE_DATE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%z";
const AWARE_DATE_ISO_PARSE: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Naive timestamps: microseconds, no offset
const NAIVE_DATE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const NAIVE_DATE_ISO_PARSE: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A value storable in the cache tier
///
/// Timestamps are split into naive and timezone-aware kinds so that each
/// round-trips through its own ISO-8601 form.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    NaiveDatetime(NaiveDateTime),
    AwareDatetime(DateTime<FixedOffset>),
}

impl CacheValue {
    /// Type tag recorded alongside the value for reconstruction
    pub fn type_tag(&self) -> &'static str {
        match self {
            CacheValue::Null => "none",
            CacheValue::Bool(_) => "bool",
            CacheValue::Int(_) => "int",
            CacheValue::Float(_) => "float",
            CacheValue::Str(_) => "str",
            CacheValue::Bytes(_) => "bytes",
            CacheValue::NaiveDatetime(_) => "naive_datetime",
            CacheValue::AwareDatetime(_) => "aware_datetime",
        }
    }

    /// Canonical string form used for digesting
    fn canonical(&self) -> String {
        match self {
            CacheValue::Null => "none".to_string(),
            CacheValue::Bool(b) => b.to_string(),
            CacheValue::Int(i) => i.to_string(),
            CacheValue::Float(f) => f.to_string(),
            CacheValue::Str(s) => s.clone(),
            CacheValue::Bytes(b) => BASE64.encode(b),
            CacheValue::NaiveDatetime(dt) => dt.format(NAIVE_DATE_ISO_FORMAT).to_string(),
            CacheValue::AwareDatetime(dt) => dt.format(AWARE_DATE_ISO_FORMAT).to_string(),
        }
    }

    /// JSON wire form of the value ("v" field)
    fn to_json(&self) -> serde_json::Value {
        match self {
            CacheValue::Null => serde_json::Value::Null,
            CacheValue::Bool(b) => serde_json::Value::from(*b),
            CacheValue::Int(i) => serde_json::Value::from(*i),
            CacheValue::Float(f) => serde_json::Value::from(*f),
            CacheValue::Str(s) => serde_json::Value::from(s.as_str()),
            CacheValue::Bytes(b) => serde_json::Value::from(BASE64.encode(b)),
            CacheValue::NaiveDatetime(dt) => {
                serde_json::Value::from(dt.format(NAIVE_DATE_ISO_FORMAT).to_string())
            }
            CacheValue::AwareDatetime(dt) => {
                serde_json::Value::from(dt.format(AWARE_DATE_ISO_FORMAT).to_string())
            }
        }
    }

    /// Reconstruct a value from its wire form and type tag
    ///
    /// Returns `None` for unknown tags, wrong JSON types, bad base64, and
    /// unparsable timestamps. The legacy `"datetime"` tag falls under the
    /// naive category.
    fn from_json(value: &serde_json::Value, tag: &str) -> Option<CacheValue> {
        match tag {
            "none" => value.is_null().then_some(CacheValue::Null),
            "bool" => value.as_bool().map(CacheValue::Bool),
            "int" => value.as_i64().map(CacheValue::Int),
            "float" => value.as_f64().map(CacheValue::Float),
            "str" => value.as_str().map(|s| CacheValue::Str(s.to_string())),
            "bytes" => {
                let encoded = value.as_str()?;
                BASE64.decode(encoded).ok().map(CacheValue::Bytes)
            }
            "naive_datetime" | "datetime" => {
                let raw = value.as_str()?;
                NaiveDateTime::parse_from_str(raw, NAIVE_DATE_ISO_PARSE)
                    .ok()
                    .map(CacheValue::NaiveDatetime)
            }
            "aware_datetime" => {
                let raw = value.as_str()?;
                DateTime::parse_from_str(raw, AWARE_DATE_ISO_PARSE)
                    .ok()
                    .map(CacheValue::AwareDatetime)
            }
            _ => None,
        }
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Str(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Str(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Int(value)
    }
}

impl From<i32> for CacheValue {
    fn from(value: i32) -> Self {
        CacheValue::Int(value as i64)
    }
}

impl From<f64> for CacheValue {
    fn from(value: f64) -> Self {
        CacheValue::Float(value)
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        CacheValue::Bool(value)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        CacheValue::Bytes(value)
    }
}

impl From<&[u8]> for CacheValue {
    fn from(value: &[u8]) -> Self {
        CacheValue::Bytes(value.to_vec())
    }
}

impl From<NaiveDateTime> for CacheValue {
    fn from(value: NaiveDateTime) -> Self {
        CacheValue::NaiveDatetime(value)
    }
}

impl From<DateTime<FixedOffset>> for CacheValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        CacheValue::AwareDatetime(value)
    }
}

impl From<DateTime<Utc>> for CacheValue {
    fn from(value: DateTime<Utc>) -> Self {
        CacheValue::AwareDatetime(value.fixed_offset())
    }
}

/// Expiry specification for a cache entry
///
/// A closed sum over everything the cache accepts as an expiry: never
/// expire, expire immediately, expire a number of seconds from now, or
/// expire at an absolute instant (normalized to UTC).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expiry {
    /// Entry never expires
    Never,
    /// Entry expires immediately
    Now,
    /// Entry expires this many seconds from now (may be negative)
    In(f64),
    /// Entry expires at an absolute UTC instant
    At(DateTime<Utc>),
}

impl Expiry {
    /// Resolve to an absolute expiry instant
    ///
    /// Second counts that are non-finite or place the instant outside the
    /// representable date range are a configuration error.
    pub fn resolve(self) -> Result<Option<DateTime<Utc>>> {
        match self {
            Expiry::Never => Ok(None),
            Expiry::Now => Ok(Some(Utc::now())),
            Expiry::In(seconds) => {
                if !seconds.is_finite() {
                    return Err(StoreError::InvalidExpiry(format!(
                        "{seconds} is not a usable second count"
                    )));
                }
                let offset = Duration::microseconds((seconds * 1_000_000.0) as i64);
                match Utc::now().checked_add_signed(offset) {
                    Some(instant) => Ok(Some(instant)),
                    None => Err(StoreError::InvalidExpiry(format!(
                        "{seconds} seconds is out of range"
                    ))),
                }
            }
            Expiry::At(instant) => Ok(Some(instant)),
        }
    }
}

/// Serialized form of a [`CacheObject`]
///
/// Field names are deliberately terse; thousands of these live inside one
/// gzip stream per namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Value in wire form
    pub v: serde_json::Value,
    /// Expiry as fractional seconds since the epoch, null = never
    pub x: Option<f64>,
    /// Type tag for reconstruction
    pub c: String,
    /// Truncated digest over the canonical string form
    #[serde(rename = "!")]
    pub sum: String,
}

/// A single typed, expiring, integrity-checked cache entry
#[derive(Debug, Clone)]
pub struct CacheObject {
    value: CacheValue,
    expires: Option<DateTime<Utc>>,
    persistent: bool,
}

impl CacheObject {
    /// Create an entry from a value, expiry, and persistence flag
    pub fn new(value: impl Into<CacheValue>, expires: Expiry, persistent: bool) -> Result<Self> {
        Ok(CacheObject {
            value: value.into(),
            expires: expires.resolve()?,
            persistent,
        })
    }

    /// Update the value, optionally altering expiry and persistence
    ///
    /// Fields passed as `None` keep their previous setting.
    pub fn set(
        &mut self,
        value: impl Into<CacheValue>,
        expires: Option<Expiry>,
        persistent: Option<bool>,
    ) -> Result<()> {
        self.value = value.into();
        if let Some(expiry) = expires {
            self.set_expiry(expiry)?;
        }
        if let Some(persistent) = persistent {
            self.persistent = persistent;
        }
        Ok(())
    }

    /// Replace the expiry
    pub fn set_expiry(&mut self, expires: Expiry) -> Result<()> {
        self.expires = expires.resolve()?;
        Ok(())
    }

    /// True while the entry has not expired
    pub fn is_live(&self) -> bool {
        match self.expires {
            None => true,
            Some(expires) => expires > Utc::now(),
        }
    }

    /// Seconds until expiry, clamped at zero; `None` when it never expires
    pub fn expires_sec(&self) -> Option<f64> {
        self.expires.map(|expires| {
            let micros = (expires - Utc::now()).num_microseconds().unwrap_or(0);
            (micros as f64 / 1_000_000.0).max(0.0)
        })
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// Canonical string form of (type, persistence, value, expiry)
    ///
    /// This is the digest input, so its shape is part of the on-disk
    /// format: changing it invalidates every stored record.
    fn canonical(&self) -> String {
        let persistent = if self.persistent { '+' } else { '-' };
        let expires = match self.expires {
            None => "never".to_string(),
            Some(expires) => expires.naive_utc().format(NAIVE_DATE_ISO_FORMAT).to_string(),
        };
        format!(
            "{}:{}:{} expires: {}",
            self.value.type_tag(),
            persistent,
            self.value.canonical(),
            expires
        )
    }

    /// Full SHA-256 hex digest over the canonical form
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Truncated digest as stored in records
    pub fn hashsum(&self) -> String {
        let mut sum = self.hash();
        sum.truncate(HASH_LENGTH);
        sum
    }

    /// The lazy-write comparison: same value and persistence
    ///
    /// Expiry is deliberately ignored so that refreshing a TTL on an
    /// otherwise unchanged entry does not count as a content change.
    pub fn same_payload(&self, other: &CacheObject) -> bool {
        self.value == other.value && self.persistent == other.persistent
    }

    /// Serialize to the record wire form
    pub fn to_record(&self) -> CacheRecord {
        CacheRecord {
            v: self.value.to_json(),
            x: self
                .expires
                .map(|expires| expires.timestamp_micros() as f64 / 1_000_000.0),
            c: self.value.type_tag().to_string(),
            sum: self.hashsum(),
        }
    }

    /// Reconstruct an entry from a record, verifying its digest
    ///
    /// Returns `None` for anything that does not check out: unknown tag,
    /// wrong value type, bad timestamp or base64 text, digest mismatch.
    pub fn from_record(record: &CacheRecord, persistent: bool, verify: bool) -> Option<CacheObject> {
        let value = match CacheValue::from_json(&record.v, &record.c) {
            Some(value) => value,
            None => {
                trace!("Cache record could not be reconstructed: tag={}", record.c);
                return None;
            }
        };

        let expires = match record.x {
            None => None,
            Some(seconds) => {
                match DateTime::<Utc>::from_timestamp_micros((seconds * 1_000_000.0) as i64) {
                    Some(expires) => Some(expires),
                    None => {
                        trace!("Cache record carries an unusable expiry: {seconds}");
                        return None;
                    }
                }
            }
        };

        let object = CacheObject {
            value,
            expires,
            persistent,
        };

        if verify && object.hashsum() != record.sum {
            debug!("Tampering detected with cache entry: {}", object.canonical());
            return None;
        }

        Some(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn roundtrip(value: CacheValue) {
        let object = CacheObject::new(value.clone(), Expiry::Never, true).unwrap();
        let record = object.to_record();
        let restored = CacheObject::from_record(&record, true, true).expect("record restores");
        assert_eq!(restored.value(), &value);
        assert_eq!(restored.expires(), None);
        assert!(restored.persistent());
    }

    #[test]
    fn test_roundtrip_all_variants() {
        roundtrip(CacheValue::Null);
        roundtrip(CacheValue::Bool(true));
        roundtrip(CacheValue::Bool(false));
        roundtrip(CacheValue::Int(-42));
        roundtrip(CacheValue::Float(3.25));
        roundtrip(CacheValue::Str("token-abc".to_string()));
        roundtrip(CacheValue::Bytes(vec![0, 1, 2, 254, 255]));
        roundtrip(CacheValue::NaiveDatetime(
            Utc.with_ymd_and_hms(2024, 6, 2, 11, 22, 33).unwrap().naive_utc(),
        ));
        roundtrip(CacheValue::AwareDatetime(
            FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 2, 11, 22, 33)
                .unwrap(),
        ));
    }

    #[test]
    fn test_roundtrip_preserves_expiry() {
        let object =
            CacheObject::new("value", Expiry::In(3600.0), true).unwrap();
        let record = object.to_record();
        let restored = CacheObject::from_record(&record, true, true).unwrap();
        // Microsecond fidelity through the fractional-seconds field
        assert_eq!(
            object.expires().unwrap().timestamp_micros(),
            restored.expires().unwrap().timestamp_micros()
        );
    }

    #[test]
    fn test_aware_offset_survives() {
        let aware = FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 8, 30, 0)
            .unwrap();
        let object = CacheObject::new(aware, Expiry::Never, true).unwrap();
        let restored = CacheObject::from_record(&object.to_record(), true, true).unwrap();
        match restored.value() {
            CacheValue::AwareDatetime(dt) => {
                assert_eq!(dt, &aware);
                assert_eq!(dt.offset().local_minus_utc(), -5 * 3600);
            }
            other => panic!("expected aware datetime, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_value_is_discarded() {
        let object = CacheObject::new("original", Expiry::Never, true).unwrap();
        let mut record = object.to_record();
        record.v = serde_json::Value::from("tampered");
        assert!(CacheObject::from_record(&record, true, true).is_none());
        // Without verification the record still loads
        assert!(CacheObject::from_record(&record, true, false).is_some());
    }

    #[test]
    fn test_tampered_type_tag_is_discarded() {
        let object = CacheObject::new(42i64, Expiry::Never, true).unwrap();
        let mut record = object.to_record();
        record.c = "str".to_string();
        assert!(CacheObject::from_record(&record, true, true).is_none());
    }

    #[test]
    fn test_unknown_tag_and_bad_payloads() {
        let object = CacheObject::new(1i64, Expiry::Never, true).unwrap();
        let mut record = object.to_record();
        record.c = "complex".to_string();
        assert!(CacheObject::from_record(&record, true, false).is_none());

        let mut record = CacheObject::new(vec![1u8, 2], Expiry::Never, true)
            .unwrap()
            .to_record();
        record.v = serde_json::Value::from("not/base64!!");
        assert!(CacheObject::from_record(&record, true, false).is_none());

        let mut record = CacheObject::new("2024", Expiry::Never, true)
            .unwrap()
            .to_record();
        record.c = "naive_datetime".to_string();
        assert!(CacheObject::from_record(&record, true, false).is_none());
    }

    #[test]
    fn test_liveness() {
        let live = CacheObject::new("v", Expiry::Never, true).unwrap();
        assert!(live.is_live());
        assert_eq!(live.expires_sec(), None);

        let dead = CacheObject::new("v", Expiry::In(-1.0), true).unwrap();
        assert!(!dead.is_live());
        assert_eq!(dead.expires_sec(), Some(0.0));

        let expiring = CacheObject::new("v", Expiry::In(3600.0), true).unwrap();
        assert!(expiring.is_live());
        assert!(expiring.expires_sec().unwrap() > 3590.0);

        // Expiry::Now expires immediately (is_live requires strictly-future)
        let now = CacheObject::new("v", Expiry::Now, true).unwrap();
        assert!(!now.is_live());
    }

    #[test]
    fn test_invalid_expiry_rejected() {
        assert!(matches!(
            CacheObject::new("v", Expiry::In(f64::NAN), true),
            Err(StoreError::InvalidExpiry(_))
        ));
        assert!(matches!(
            Expiry::In(f64::INFINITY).resolve(),
            Err(StoreError::InvalidExpiry(_))
        ));
    }

    #[test]
    fn test_out_of_range_expiry_rejected() {
        // Finite but beyond the representable date range in either direction
        assert!(matches!(
            Expiry::In(1.0e13).resolve(),
            Err(StoreError::InvalidExpiry(_))
        ));
        assert!(matches!(
            Expiry::In(-1.0e13).resolve(),
            Err(StoreError::InvalidExpiry(_))
        ));
        assert!(matches!(
            CacheObject::new("v", Expiry::In(f64::MAX), true),
            Err(StoreError::InvalidExpiry(_))
        ));
    }

    #[test]
    fn test_same_payload_ignores_expiry() {
        let a = CacheObject::new("v", Expiry::Never, true).unwrap();
        let b = CacheObject::new("v", Expiry::In(60.0), true).unwrap();
        assert!(a.same_payload(&b));

        let c = CacheObject::new("v", Expiry::Never, false).unwrap();
        assert!(!a.same_payload(&c));

        let d = CacheObject::new("other", Expiry::Never, true).unwrap();
        assert!(!a.same_payload(&d));
    }

    #[test]
    fn test_set_leaves_unspecified_fields() {
        let mut object = CacheObject::new("v1", Expiry::In(60.0), false).unwrap();
        let expires = object.expires();

        object.set("v2", None, None).unwrap();
        assert_eq!(object.value(), &CacheValue::Str("v2".to_string()));
        assert_eq!(object.expires(), expires);
        assert!(!object.persistent());

        object.set("v3", Some(Expiry::Never), Some(true)).unwrap();
        assert_eq!(object.expires(), None);
        assert!(object.persistent());
    }

    #[test]
    fn test_record_field_names() {
        let object = CacheObject::new(7i64, Expiry::Never, true).unwrap();
        let json = serde_json::to_value(object.to_record()).unwrap();
        let map = json.as_object().unwrap();
        assert!(map.contains_key("v"));
        assert!(map.contains_key("x"));
        assert!(map.contains_key("c"));
        assert!(map.contains_key("!"));
        assert_eq!(map["c"], "int");
        assert_eq!(map["x"], serde_json::Value::Null);
        assert_eq!(map["!"].as_str().unwrap().len(), 6);
    }
}
