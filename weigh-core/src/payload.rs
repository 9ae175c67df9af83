//! Payload canonicalisation and hashing (§6).
//!
//! `payload_json` is the *exact* byte sequence POSTed to the ERP; the hash
//! stored alongside it must be computed over those same bytes, so
//! canonicalisation happens once, here, and every caller (orchestrator,
//! tests) reuses the result instead of re-serializing.

use crate::model::WeighEvent;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Serialize)]
struct CanonicalPayload<'a> {
    event_id: &'a str,
    device_id: &'a str,
    batch_id: &'a str,
    product_id: &'a str,
    seq: u64,
    weight: f64,
    ts: f64,
}

/// Round a value to 3 decimal places, matching §6's `weight`/`ts` precision.
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Canonical JSON bytes plus their lowercase-hex SHA-256, for a single event.
pub struct CanonicalizedPayload {
    pub json: String,
    pub hash_hex: String,
}

pub fn canonicalize(event: &WeighEvent) -> CanonicalizedPayload {
    let canonical = CanonicalPayload {
        event_id: &event.event_id,
        device_id: &event.device_id,
        batch_id: &event.batch_id,
        product_id: &event.product_id,
        seq: event.seq,
        weight: round3(event.weight),
        ts: round3(event.ts),
    };
    // serde_json's struct serialization preserves field-declaration order,
    // which is all the determinism this format needs: field order is fixed
    // by `CanonicalPayload`'s own definition, not by a runtime sort.
    let json = serde_json::to_string(&canonical).expect("canonical payload is always serializable");
    let hash_hex = hash_hex(json.as_bytes());
    CanonicalizedPayload { json, hash_hex }
}

pub fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> WeighEvent {
        WeighEvent {
            event_id: "a".repeat(32),
            device_id: "dev-1".into(),
            batch_id: "batch-1".into(),
            product_id: "prod-1".into(),
            seq: 1,
            weight: 5.0001,
            ts: 12.3456,
        }
    }

    #[test]
    fn rounds_weight_and_ts_to_three_decimals() {
        let out = canonicalize(&sample_event());
        assert!(out.json.contains("\"weight\":5.0"));
        assert!(out.json.contains("\"ts\":12.346"));
    }

    #[test]
    fn hash_is_lowercase_hex_sha256_of_the_exact_bytes() {
        let out = canonicalize(&sample_event());
        assert_eq!(out.hash_hex.len(), 64);
        assert!(out.hash_hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(out.hash_hex, hash_hex(out.json.as_bytes()));
    }

    #[test]
    fn same_event_hashes_identically() {
        let a = canonicalize(&sample_event());
        let b = canonicalize(&sample_event());
        assert_eq!(a.json, b.json);
        assert_eq!(a.hash_hex, b.hash_hex);
    }

    #[test]
    fn different_seq_changes_the_hash() {
        let mut e2 = sample_event();
        e2.seq = 2;
        let a = canonicalize(&sample_event());
        let b = canonicalize(&e2);
        assert_ne!(a.hash_hex, b.hash_hex);
    }
}
