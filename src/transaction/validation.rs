/// Validity checks run before a transaction is propagated or staged
use crate::error::{LedgerError, Result};
use crate::transaction::types::{SignedTransaction, Transaction};

/// The transaction-validity oracle. Signature verification lives behind this
/// seam and is not implemented here.
pub trait TransactionValidator: Send + Sync {
    fn validate(&self, signed: &SignedTransaction) -> Result<()>;
}

/// Structural validation only: well-formed code, timestamp, payload and
/// `valid` flag. Accepts any signature set.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicValidator;

impl TransactionValidator for BasicValidator {
    fn validate(&self, signed: &SignedTransaction) -> Result<()> {
        signed.transaction.validate_shape()
    }
}

impl Transaction {
    pub fn validate_shape(&self) -> Result<()> {
        if self.transaction_code.trim().is_empty() {
            return Err(LedgerError::InvalidTransaction(
                "transaction_code is empty".to_string(),
            ));
        }
        if self.timestamp.trim().is_empty() {
            return Err(LedgerError::InvalidTransaction(format!(
                "Transaction {} has no timestamp",
                self.transaction_code
            )));
        }
        if self.valid != 1 {
            return Err(LedgerError::InvalidTransaction(format!(
                "Transaction {} is flagged invalid",
                self.transaction_code
            )));
        }
        if self.fee < 0.0 {
            return Err(LedgerError::InvalidTransaction(format!(
                "Transaction {} has a negative fee",
                self.transaction_code
            )));
        }
        self.specific()?;
        Ok(())
    }
}
