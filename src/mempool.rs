//! Mempool staging: candidate blocks and receipts held on disk before finalization
//!
//! - [`staging`] - file-addressed Staging Store keyed by target block index
//! - [`sequence`] - staged file naming and the per-(kind, index) suffix counter

pub mod sequence;
pub mod staging;

pub use sequence::{SequenceAllocator, StagedFileName, StagedKind};
pub use staging::StagingStore;

use crate::transaction::Receipt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A mutable, not-yet-finalized block candidate.
///
/// Several instances may exist for the same index; picking the canonical one
/// is up to block finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedBlock {
    pub index: u64,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
    /// Proposer-specific fields (timestamp, proof, transaction list, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StagedBlock {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            receipts: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn has_signer(&self, public_key: &str) -> bool {
        self.receipts.iter().any(|r| r.public_key == public_key)
    }

    /// Inserts `receipt` unless one from the same signer is already present.
    /// Returns whether an insertion occurred.
    pub fn append_receipt(&mut self, receipt: Receipt) -> bool {
        if self.has_signer(&receipt.public_key) {
            return false;
        }
        self.receipts.push(receipt);
        true
    }
}
