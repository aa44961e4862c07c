//! Ledger anchoring: tamper-evident, chain-anchored records of business events.
//!
//! Producers hand in `(transaction_type, source_module, source_id, data)` tuples per
//! organization. Each is canonically hashed, persisted, submitted to an EVM or Substrate
//! chain (individually or as a Merkle-rooted batch), retried with backoff and confirmed.

pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
