//! Deterministic hashing primitives for ledger records.
//!
//! Everything here is pure: no I/O, no clocks, no randomness. The canonical encoding of
//! `transaction_data` is RFC 8785 (JSON Canonicalization Scheme) and must never change,
//! otherwise previously anchored hashes stop verifying.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Canonical JSON encoding used for every hash input.
pub fn canonical_json(value: &Value) -> Result<String, AppError> {
    serde_jcs::to_string(value).map_err(|e| AppError::Serialization(e.to_string()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a business event: `type:module:source_id:canonical(data):org_id`.
pub fn transaction_hash(
    transaction_type: &str,
    source_module: &str,
    source_id: &str,
    transaction_data: &Value,
    organization_id: &str,
) -> Result<String, AppError> {
    let data = canonical_json(transaction_data)?;
    let input = [
        transaction_type,
        source_module,
        source_id,
        data.as_str(),
        organization_id,
    ]
    .join(":");
    Ok(sha256_hex(input.as_bytes()))
}

/// Recompute a transaction hash and compare it with `expected_hash`.
pub fn verify_hash(
    transaction_type: &str,
    source_module: &str,
    source_id: &str,
    transaction_data: &Value,
    organization_id: &str,
    expected_hash: &str,
) -> Result<bool, AppError> {
    let actual = transaction_hash(
        transaction_type,
        source_module,
        source_id,
        transaction_data,
        organization_id,
    )?;
    Ok(actual.eq_ignore_ascii_case(expected_hash))
}

/// SHA-256 over the concatenation of the hashes in the given order.
pub fn batch_hash<S: AsRef<str>>(hashes: &[S]) -> String {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Merkle root over ordered leaf hashes.
///
/// An empty list hashes the empty byte string. Otherwise adjacent leaves are paired and
/// the concatenation of each pair is hashed; an odd trailing leaf is paired with itself.
/// A single leaf is therefore hashed with itself as well.
pub fn merkle_root<S: AsRef<str>>(hashes: &[S]) -> String {
    if hashes.is_empty() {
        return sha256_hex(b"");
    }

    let mut level: Vec<String> = hashes.iter().map(|h| h.as_ref().to_string()).collect();
    loop {
        let next: Vec<String> = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                sha256_hex(format!("{left}{right}").as_bytes())
            })
            .collect();
        if next.len() == 1 {
            return next.into_iter().next().unwrap_or_default();
        }
        level = next;
    }
}

/// HMAC-SHA256 of `data`, hex encoded.
pub fn hmac_signature(data: &str, secret: &[u8]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AppError::Internal(format!("invalid HMAC secret: {e}")))?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of an HMAC signature. Malformed signatures never verify.
pub fn verify_hmac(data: &str, signature: &str, secret: &[u8]) -> Result<bool, AppError> {
    let expected = hmac_signature(data, secret)?;
    let Ok(provided) = hex::decode(signature) else {
        return Ok(false);
    };
    let Ok(expected) = hex::decode(expected) else {
        return Ok(false);
    };
    if provided.len() != expected.len() {
        return Ok(false);
    }
    Ok(provided.ct_eq(expected.as_slice()).into())
}

/// Exactly 64 hex characters, either case.
#[must_use]
pub fn validate_hash_format(value: &str) -> bool {
    value.len() == HASH_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Plain SHA-256 of a string.
#[must_use]
pub fn content_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}

/// Hash of an audit event: `transaction_id:event_type:canonical(data):timestamp`.
pub fn audit_hash(
    transaction_id: &str,
    event_type: &str,
    event_data: &Value,
    timestamp: &str,
) -> Result<String, AppError> {
    let data = canonical_json(event_data)?;
    Ok(sha256_hex(
        format!("{transaction_id}:{event_type}:{data}:{timestamp}").as_bytes(),
    ))
}

/// Hash linking `current` to `previous`, optionally salted with a nonce.
#[must_use]
pub fn chain_hash(previous: &str, current: &str, nonce: Option<u64>) -> String {
    let input = match nonce {
        Some(n) => format!("{previous}:{current}:{n}"),
        None => format!("{previous}:{current}"),
    };
    sha256_hex(input.as_bytes())
}

/// Display prefix of a content hash.
#[must_use]
pub fn short_hash(data: &str, len: usize) -> String {
    let mut full = content_hash(data);
    full.truncate(len.min(HASH_HEX_LEN));
    full
}
