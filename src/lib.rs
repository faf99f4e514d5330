//! Ledgernode - a permissioned ledger node
//!
//! # Architecture
//!
//! ## Transactions & Staging
//! - [`transaction`] - Transaction, receipt and signed-envelope types plus validation
//! - [`mempool`] - File-addressed staging of candidate blocks and receipts
//!
//! ## Networking
//! - [`peers`] - Peer model and peer directory
//! - [`propagation`] - Concurrent fire-and-forget fan-out to peers
//!
//! ## Ledger
//! - [`ledger`] - Finalized blocks, transactions and derived state (SQLite)
//! - [`state`] - State-transition function applied per transaction
//! - [`replay`] - Chain revert and derived-state rebuild
//!
//! ## Node & Integration
//! - [`node`] - Orchestrator wiring the stores together
//! - [`api`] - HTTP API (axum)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Transactions & Staging
// ============================================================================
pub mod mempool;
pub mod transaction;

// ============================================================================
// Networking
// ============================================================================
pub mod peers;
pub mod propagation;

// ============================================================================
// Ledger
// ============================================================================
pub mod ledger;
pub mod replay;
pub mod state;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{LedgerError, Result};
