//! Core domain model and identity derivation for HLT.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "hlt-core";

/// Identity keys always fall in `[0, KEY_SPACE)`.
pub const KEY_SPACE: u64 = 100_000_000;

/// One observed offer from a source, as structured attributes.
///
/// Produced by an adapter once per item per cycle and discarded after
/// reconciliation; never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub reference: String,
    pub title: String,
    pub rooms: u32,
    pub price: f64,
    pub price_per_area: f64,
    pub area: f64,
}

/// One entry of the append-only price log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// The persisted, reconciled representation of one distinct identity
/// across all cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: i64,
    pub title: String,
    pub reference: String,
    pub rooms: u32,
    pub area: f64,
    pub price: f64,
    pub price_per_area: f64,
    /// One entry per price *change*, never per observation. Never shrinks,
    /// never reorders.
    pub price_history: Vec<PricePoint>,
    /// First-ever observation; set once, never overwritten.
    pub added_at: DateTime<Utc>,
    /// Absent while the record is live; stamped once the identity drops out
    /// of an observed cycle, cleared again on revival.
    pub expired_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn from_listing(key: i64, listing: &Listing, now: DateTime<Utc>) -> Self {
        Self {
            key,
            title: listing.title.clone(),
            reference: listing.reference.clone(),
            rooms: listing.rooms,
            area: listing.area,
            price: listing.price,
            price_per_area: listing.price_per_area,
            price_history: vec![PricePoint {
                price: listing.price,
                observed_at: now,
            }],
            added_at: now,
            expired_at: None,
        }
    }

    /// Price of the latest history entry; `None` only for a record that was
    /// never observed, which cannot occur for a live record.
    pub fn last_price(&self) -> Option<f64> {
        self.price_history.last().map(|point| point.price)
    }

    pub fn is_live(&self) -> bool {
        self.expired_at.is_none()
    }
}

/// Classification of one reconciliation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    PriceChanged,
    Unchanged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("reference {0:?} has no stable token between the last '-' and the last '.'")]
    MalformedReference(String),
}

/// Extracts the stable per-listing token embedded in a reference: the
/// substring between the last `-` and the last `.`.
///
/// Sources keep this trailing numeric token stable across observations of
/// the same physical listing even when the rest of the URL is reworded.
pub fn stable_token(reference: &str) -> Result<&str, IdentityError> {
    let malformed = || IdentityError::MalformedReference(reference.to_string());
    let dot = reference.rfind('.').ok_or_else(malformed)?;
    let dash = reference[..dot].rfind('-').ok_or_else(malformed)?;
    let token = &reference[dash + 1..dot];
    if token.is_empty() {
        return Err(malformed());
    }
    Ok(token)
}

/// Derives the identity key for a reference: SHA-256 of the stable token,
/// digest folded as a big-endian integer modulo [`KEY_SPACE`].
///
/// Deterministic with no run-specific salt: identical token means identical
/// key, for all runs, forever. The 8-digit reduction trades collision safety
/// for a compact, human-loggable key.
pub fn derive_key(reference: &str) -> Result<i64, IdentityError> {
    let token = stable_token(reference)?;
    let digest = Sha256::digest(token.as_bytes());
    let key = digest
        .iter()
        .fold(0u64, |acc, byte| (acc * 256 + u64::from(*byte)) % KEY_SPACE);
    Ok(key as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn listing(reference: &str, price: f64) -> Listing {
        Listing {
            reference: reference.to_string(),
            title: "Mieszkanie 3 pokoje".to_string(),
            rooms: 3,
            price,
            price_per_area: price / 54.5,
            area: 54.5,
        }
    }

    #[test]
    fn stable_token_takes_trailing_segment() {
        let token =
            stable_token("https://example.com/oferta/mieszkanie-12345.html").unwrap();
        assert_eq!(token, "12345");
    }

    #[test]
    fn stable_token_uses_last_delimiters() {
        let token = stable_token("a-b.c/dom-cichy-99887766.html").unwrap();
        assert_eq!(token, "99887766");
    }

    #[test]
    fn missing_dash_before_last_dot_is_malformed() {
        let err = stable_token("mieszkanie12345.html").unwrap_err();
        assert_eq!(
            err,
            IdentityError::MalformedReference("mieszkanie12345.html".to_string())
        );
    }

    #[test]
    fn missing_dot_is_malformed() {
        assert!(stable_token("mieszkanie-12345").is_err());
    }

    #[test]
    fn empty_token_is_malformed() {
        assert!(stable_token("mieszkanie-.html").is_err());
    }

    #[test]
    fn derive_key_is_deterministic_and_bounded() {
        let reference = "https://example.com/oferta/mieszkanie-12345.html";
        let first = derive_key(reference).unwrap();
        let second = derive_key(reference).unwrap();
        assert_eq!(first, second);
        assert!(first >= 0);
        assert!((first as u64) < KEY_SPACE);
    }

    #[test]
    fn derive_key_depends_only_on_the_token() {
        let a = derive_key("https://a.example/mieszkanie-777.html").unwrap();
        let b = derive_key("https://b.example/kawalerka-tania-777.html").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_tokens_produce_distinct_keys() {
        let a = derive_key("oferta-10001.html").unwrap();
        let b = derive_key("oferta-10002.html").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn derive_key_propagates_malformed_reference() {
        assert!(derive_key("no delimiters here").is_err());
    }

    #[test]
    fn record_from_listing_seeds_history_and_added_at() {
        let now = ts();
        let record = Record::from_listing(42, &listing("x-1.html", 500_000.0), now);
        assert_eq!(record.key, 42);
        assert_eq!(record.price_history.len(), 1);
        assert_eq!(record.last_price(), Some(500_000.0));
        assert_eq!(record.added_at, now);
        assert!(record.is_live());
    }
}
