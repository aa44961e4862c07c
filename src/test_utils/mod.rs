//! Test helpers shared by unit and integration tests.

pub mod mocks;

pub use mocks::{MockChainClient, MockConfig, MockLedgerStore};
