//! Shared chain builders for integration tests
#![allow(dead_code)]

use ledgernode::error::Result;
use ledgernode::ledger::{FinalizedBlock, Ledger};
use ledgernode::state::{LedgerStateMachine, StateTransition};
use ledgernode::transaction::{SignedTransaction, Transaction, TransactionType};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

pub const TREASURY: &str = "treasury";
pub const TOKEN: &str = "GOLD";

pub fn transaction(code: &str, block_index: u64, kind: TransactionType, specific_data: Value) -> Transaction {
    Transaction {
        transaction_code: code.to_string(),
        block_index,
        timestamp: format!("2024-01-01 00:00:{:02}", block_index % 60),
        kind,
        currency: "INR".to_string(),
        fee: 0.0,
        description: String::new(),
        valid: 1,
        specific_data,
    }
}

pub fn signed(tx: Transaction) -> SignedTransaction {
    SignedTransaction {
        transaction: tx,
        signatures: Vec::new(),
    }
}

/// Genesis mints the token to the treasury; every later block registers a
/// wallet and pays it from the treasury.
pub fn block_transactions(index: u64) -> Vec<Transaction> {
    if index == 0 {
        return vec![transaction(
            "tx-0-0",
            0,
            TransactionType::CreateToken,
            json!({"tokencode": TOKEN, "first_owner": TREASURY, "amount_created": 1_000_000.0}),
        )];
    }

    let wallet = format!("wallet-{}", index % 7);
    vec![
        transaction(
            &format!("tx-{}-0", index),
            index,
            TransactionType::AddWallet,
            json!({"wallet_address": wallet, "custodian_wallet": TREASURY}),
        ),
        transaction(
            &format!("tx-{}-1", index),
            index,
            TransactionType::OneWayTransfer,
            json!({
                "asset1_code": TOKEN,
                "wallet1": TREASURY,
                "wallet2": wallet,
                "asset1_number": index as f64
            }),
        ),
    ]
}

pub fn append_block(ledger: &Ledger, index: u64, transactions: &[Transaction]) -> FinalizedBlock {
    let previous_hash = match index {
        0 => "0".to_string(),
        i => ledger.get_block(i - 1).unwrap().unwrap().hash,
    };
    let block = FinalizedBlock::new(index, format!("block-time-{}", index), index as i64, previous_hash, transactions)
        .unwrap();
    ledger.finalize_block(&block, transactions).unwrap();
    block
}

/// Finalizes blocks `0..=last`.
pub fn build_chain(ledger: &Ledger, last: u64) {
    for index in 0..=last {
        append_block(ledger, index, &block_transactions(index));
    }
}

/// Blocks inside the first apply after `arm` until released.
pub struct GateTransition {
    armed: AtomicBool,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GateTransition {
    /// Returns the gate, a receiver signalled once an apply is held, and the
    /// sender that lets it continue.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Self {
            armed: AtomicBool::new(false),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
        });
        (gate, entered_rx, release_tx)
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl StateTransition for GateTransition {
    fn apply_transaction(
        &self,
        db: &Connection,
        kind: TransactionType,
        payload: &Value,
        transaction_code: &str,
        timestamp: &str,
    ) -> Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(entered) = self.entered.lock().take() {
                entered.send(()).unwrap();
            }
            let release = self.release.lock().take();
            if let Some(release) = release {
                release.recv().unwrap();
            }
        }
        LedgerStateMachine.apply_transaction(db, kind, payload, transaction_code, timestamp)
    }
}
