//! Ledger Store (SQLite)
//!
//! Finalized blocks and transactions plus the derived `wallets`, `tokens` and
//! `balances` tables. Every write path (block finalization and revert) takes
//! the same connection lock for its whole duration, so a revert can never
//! interleave with a finalization.

pub mod schema;

use crate::error::{LedgerError, Result};
use crate::replay::{self, RevertReport};
use crate::state::{self, LedgerStateMachine, StateTransition};
use crate::transaction::{Transaction, TransactionType};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedBlock {
    pub block_index: u64,
    pub timestamp: String,
    pub proof: i64,
    pub previous_hash: String,
    pub hash: String,
    pub transactions_hash: String,
}

impl FinalizedBlock {
    /// Builds a block over `transactions`, filling in both hashes.
    pub fn new(
        block_index: u64,
        timestamp: impl Into<String>,
        proof: i64,
        previous_hash: impl Into<String>,
        transactions: &[Transaction],
    ) -> Result<Self> {
        let mut block = FinalizedBlock {
            block_index,
            timestamp: timestamp.into(),
            proof,
            previous_hash: previous_hash.into(),
            hash: String::new(),
            transactions_hash: Self::compute_transactions_hash(transactions)?,
        };
        block.hash = block.compute_hash();
        Ok(block)
    }

    /// SHA-256 over the canonical JSON of `transactions`, hex encoded.
    pub fn compute_transactions_hash(transactions: &[Transaction]) -> Result<String> {
        let encoded = serde_json::to_vec(transactions)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.block_index.to_le_bytes());
        hasher.update(self.timestamp.as_bytes());
        hasher.update(self.proof.to_le_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.transactions_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletRow {
    pub wallet_address: String,
    pub wallet_public: Option<String>,
    pub wallet_private: Option<String>,
    pub custodian_wallet: Option<String>,
    pub kyc_docs: Option<String>,
    pub owner_type: Option<i64>,
    pub jurisdiction: Option<i64>,
    pub specific_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRow {
    pub tokencode: String,
    pub tokenname: Option<String>,
    pub tokentype: Option<i64>,
    pub first_owner: Option<String>,
    pub custodian: Option<String>,
    pub legaldochash: Option<String>,
    pub amount_created: Option<f64>,
    pub value_created: Option<f64>,
    pub sc_flag: Option<i64>,
    pub disallowed: Option<String>,
    pub tokendecimal: Option<i64>,
    pub parent_transaction_code: Option<String>,
    pub token_attributes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub wallet_address: String,
    pub tokencode: String,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub blocks: Vec<FinalizedBlock>,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub wallets: Vec<WalletRow>,
    pub tokens: Vec<TokenRow>,
    pub balances: Vec<BalanceRow>,
}

/// A `transactions` row as stored, before payload decoding.
#[derive(Debug, Clone)]
pub(crate) struct TransactionRow {
    pub transaction_code: String,
    pub block_index: u64,
    pub timestamp: String,
    pub kind: i64,
    pub currency: Option<String>,
    pub fee: Option<f64>,
    pub description: Option<String>,
    pub valid: Option<i64>,
    pub specific_data: String,
}

impl TransactionRow {
    pub fn into_transaction(self) -> Result<Transaction> {
        Ok(Transaction {
            kind: TransactionType::from_code(self.kind)?,
            specific_data: replay::decode_specific_data(&self.specific_data)?,
            transaction_code: self.transaction_code,
            block_index: self.block_index,
            timestamp: self.timestamp,
            currency: self.currency.unwrap_or_default(),
            fee: self.fee.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            valid: self.valid.unwrap_or(1),
        })
    }
}

const TRANSACTION_COLUMNS: &str =
    "transaction_code, block_index, timestamp, type, currency, fee, description, valid, specific_data";

/// Retained transactions in replay order: ascending block index, then
/// insertion order within a block.
pub(crate) fn load_transaction_rows(conn: &Connection, up_to: Option<u64>) -> Result<Vec<TransactionRow>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE block_index <= ?1 ORDER BY block_index ASC, rowid ASC",
        TRANSACTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![up_to.map_or(i64::MAX, to_sql_index)], read_transaction_row)?;

    let mut loaded = Vec::new();
    for row in rows {
        loaded.push(row?);
    }
    Ok(loaded)
}

fn read_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRow> {
    Ok(TransactionRow {
        transaction_code: row.get(0)?,
        block_index: row.get::<_, i64>(1)? as u64,
        timestamp: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        kind: row.get(3)?,
        currency: row.get(4)?,
        fee: row.get(5)?,
        description: row.get(6)?,
        valid: row.get(7)?,
        specific_data: row.get::<_, Option<String>>(8)?.unwrap_or_else(|| "null".to_string()),
    })
}

fn read_block_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FinalizedBlock> {
    Ok(FinalizedBlock {
        block_index: row.get::<_, i64>(0)? as u64,
        timestamp: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        proof: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
        previous_hash: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        hash: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        transactions_hash: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
    })
}

/// Block indexes above `i64::MAX` saturate; SQLite integers are signed.
pub(crate) fn to_sql_index(index: u64) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

pub struct Ledger {
    conn: Mutex<Connection>,
    transition: Arc<dyn StateTransition>,
}

impl Ledger {
    /// Opens (or creates) the ledger at `path` with the default state machine.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, Arc::new(LedgerStateMachine))
    }

    pub fn open_with(path: &str, transition: Arc<dyn StateTransition>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::create_schema(&conn)?;
        Ok(Ledger {
            conn: Mutex::new(conn),
            transition,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Creates any missing table.
    pub fn init(&self) -> Result<()> {
        schema::create_schema(&self.conn.lock())?;
        Ok(())
    }

    /// Drops every table and recreates an empty ledger.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        schema::drop_all(&tx)?;
        schema::create_schema(&tx)?;
        tx.commit()?;
        info!("ledger cleared");
        Ok(())
    }

    /// Appends `block` with its `transactions` and applies them to the
    /// derived tables, all in one SQLite transaction.
    pub fn finalize_block(&self, block: &FinalizedBlock, transactions: &[Transaction]) -> Result<()> {
        let expected_hash = FinalizedBlock::compute_transactions_hash(transactions)?;
        if block.transactions_hash != expected_hash {
            return Err(LedgerError::InvalidBlock(format!(
                "Block {} transactions_hash does not match its transactions",
                block.block_index
            )));
        }
        if let Some(tx) = transactions.iter().find(|t| t.block_index != block.block_index) {
            return Err(LedgerError::InvalidBlock(format!(
                "Transaction {} targets block {} but was finalized in block {}",
                tx.transaction_code, tx.block_index, block.block_index
            )));
        }

        let mut conn = self.conn.lock();
        let db = conn.transaction()?;

        let head = db
            .query_row(
                "SELECT block_index, hash FROM blocks ORDER BY block_index DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        match head {
            None if block.block_index != 0 => {
                return Err(LedgerError::InvalidBlock(format!(
                    "Empty ledger must start at block 0, got {}",
                    block.block_index
                )))
            }
            Some((index, _)) if block.block_index != index + 1 => {
                return Err(LedgerError::InvalidBlock(format!(
                    "Block {} does not extend head {}",
                    block.block_index, index
                )))
            }
            Some((_, hash)) if hash.as_deref() != Some(block.previous_hash.as_str()) => {
                return Err(LedgerError::InvalidBlock(format!(
                    "Block {} previous_hash does not match head hash",
                    block.block_index
                )))
            }
            _ => {}
        }

        db.execute(
            "INSERT INTO blocks (block_index, timestamp, proof, previous_hash, hash, transactions_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                to_sql_index(block.block_index),
                block.timestamp,
                block.proof,
                block.previous_hash,
                block.hash,
                block.transactions_hash,
            ],
        )?;

        for tx in transactions {
            db.execute(
                &format!(
                    "INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    TRANSACTION_COLUMNS
                ),
                params![
                    tx.transaction_code,
                    to_sql_index(tx.block_index),
                    tx.timestamp,
                    tx.kind.code(),
                    tx.currency,
                    tx.fee,
                    tx.description,
                    tx.valid,
                    serde_json::to_string(&tx.specific_data)?,
                ],
            )?;
            self.transition.apply_transaction(
                &db,
                tx.kind,
                &tx.specific_data,
                &tx.transaction_code,
                &tx.timestamp,
            )?;
        }

        db.commit()?;
        info!(
            block_index = block.block_index,
            transactions = transactions.len(),
            "block finalized"
        );
        Ok(())
    }

    /// Truncates the chain to `target_index` and rebuilds derived state by
    /// replaying the retained log. Waits for any in-progress write.
    pub fn revert(&self, target_index: u64) -> Result<RevertReport> {
        let mut conn = self.conn.lock();
        replay::revert_chain(&mut conn, self.transition.as_ref(), target_index)
    }

    /// Like [`Ledger::revert`] but fails with `LedgerConcurrency` instead of
    /// waiting when another write holds the ledger.
    pub fn try_revert(&self, target_index: u64) -> Result<RevertReport> {
        let Some(mut conn) = self.conn.try_lock() else {
            return Err(LedgerError::LedgerConcurrency);
        };
        replay::revert_chain(&mut conn, self.transition.as_ref(), target_index)
    }

    /// Target index of a committed revert whose staged-file prune has not
    /// been confirmed yet.
    pub fn pending_staging_prune(&self) -> Result<Option<u64>> {
        let value = schema::get_meta(&self.conn.lock(), schema::PENDING_PRUNE_KEY)?;
        value
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    LedgerError::InvalidBlock(format!("bad {} marker {:?}: {}", schema::PENDING_PRUNE_KEY, v, e))
                })
            })
            .transpose()
    }

    /// Clears the prune marker if it still names `target_index`. A later
    /// revert's marker is left in place; returns whether it was cleared.
    pub fn clear_staging_prune_marker(&self, target_index: u64) -> Result<bool> {
        let cleared = schema::delete_meta_if(
            &self.conn.lock(),
            schema::PENDING_PRUNE_KEY,
            &target_index.to_string(),
        )?;
        Ok(cleared)
    }

    pub fn last_block_index(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let index: Option<i64> = conn.query_row("SELECT MAX(block_index) FROM blocks", [], |row| row.get(0))?;
        Ok(index.map(|i| i as u64))
    }

    pub fn get_block(&self, index: u64) -> Result<Option<FinalizedBlock>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT block_index, timestamp, proof, previous_hash, hash, transactions_hash
                 FROM blocks WHERE block_index = ?1",
                params![to_sql_index(index)],
                read_block_row,
            )
            .optional()?)
    }

    /// Blocks among `indexes` that exist, in the order requested.
    pub fn get_blocks(&self, indexes: &[u64]) -> Result<Vec<FinalizedBlock>> {
        let mut blocks = Vec::with_capacity(indexes.len());
        for index in indexes {
            if let Some(block) = self.get_block(*index)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    pub fn get_transaction(&self, transaction_code: &str) -> Result<Option<Transaction>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM transactions WHERE transaction_code = ?1", TRANSACTION_COLUMNS),
                params![transaction_code],
                read_transaction_row,
            )
            .optional()?
        };
        row.map(TransactionRow::into_transaction).transpose()
    }

    pub fn balance(&self, wallet_address: &str, tokencode: &str) -> Result<f64> {
        state::balance_of(&self.conn.lock(), wallet_address, tokencode)
    }

    pub fn balances_by_wallet(&self, wallet_address: &str) -> Result<Vec<BalanceRow>> {
        self.query_balances("WHERE wallet_address = ?1", wallet_address)
    }

    pub fn balances_by_token(&self, tokencode: &str) -> Result<Vec<BalanceRow>> {
        self.query_balances("WHERE tokencode = ?1", tokencode)
    }

    fn query_balances(&self, filter: &str, key: &str) -> Result<Vec<BalanceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT wallet_address, tokencode, balance FROM balances {} ORDER BY wallet_address, tokencode",
            filter
        ))?;
        let rows = stmt.query_map(params![key], read_balance_row)?;
        let mut balances = Vec::new();
        for row in rows {
            balances.push(row?);
        }
        Ok(balances)
    }

    pub fn download_chain(&self) -> Result<ChainSnapshot> {
        let (blocks, rows) = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT block_index, timestamp, proof, previous_hash, hash, transactions_hash
                 FROM blocks ORDER BY block_index ASC",
            )?;
            let mut blocks = Vec::new();
            for block in stmt.query_map([], read_block_row)? {
                blocks.push(block?);
            }
            (blocks, load_transaction_rows(&conn, None)?)
        };

        let transactions = rows
            .into_iter()
            .map(TransactionRow::into_transaction)
            .collect::<Result<Vec<_>>>()?;
        Ok(ChainSnapshot { blocks, transactions })
    }

    pub fn download_state(&self) -> Result<StateSnapshot> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT wallet_address, wallet_public, wallet_private, custodian_wallet, kyc_docs,
                    owner_type, jurisdiction, specific_data
             FROM wallets ORDER BY wallet_address",
        )?;
        let mut wallets = Vec::new();
        for wallet in stmt.query_map([], |row| {
            Ok(WalletRow {
                wallet_address: row.get(0)?,
                wallet_public: row.get(1)?,
                wallet_private: row.get(2)?,
                custodian_wallet: row.get(3)?,
                kyc_docs: row.get(4)?,
                owner_type: row.get(5)?,
                jurisdiction: row.get(6)?,
                specific_data: row.get(7)?,
            })
        })? {
            wallets.push(wallet?);
        }

        let mut stmt = conn.prepare(
            "SELECT tokencode, tokenname, tokentype, first_owner, custodian, legaldochash,
                    amount_created, value_created, sc_flag, disallowed, tokendecimal,
                    parent_transaction_code, token_attributes
             FROM tokens ORDER BY tokencode",
        )?;
        let mut tokens = Vec::new();
        for token in stmt.query_map([], |row| {
            Ok(TokenRow {
                tokencode: row.get(0)?,
                tokenname: row.get(1)?,
                tokentype: row.get(2)?,
                first_owner: row.get(3)?,
                custodian: row.get(4)?,
                legaldochash: row.get(5)?,
                amount_created: row.get(6)?,
                value_created: row.get(7)?,
                sc_flag: row.get(8)?,
                disallowed: row.get(9)?,
                tokendecimal: row.get(10)?,
                parent_transaction_code: row.get(11)?,
                token_attributes: row.get(12)?,
            })
        })? {
            tokens.push(token?);
        }

        let mut stmt = conn.prepare(
            "SELECT wallet_address, tokencode, balance FROM balances ORDER BY wallet_address, tokencode",
        )?;
        let mut balances = Vec::new();
        for balance in stmt.query_map([], read_balance_row)? {
            balances.push(balance?);
        }

        Ok(StateSnapshot {
            wallets,
            tokens,
            balances,
        })
    }
}

fn read_balance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BalanceRow> {
    Ok(BalanceRow {
        wallet_address: row.get(0)?,
        tokencode: row.get(1)?,
        balance: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_tx(code: &str, block_index: u64) -> Transaction {
        Transaction {
            transaction_code: code.to_string(),
            block_index,
            timestamp: "2024-01-01 00:00:00".to_string(),
            kind: TransactionType::CreateToken,
            currency: "INR".to_string(),
            fee: 0.0,
            description: "New token creation".to_string(),
            valid: 1,
            specific_data: json!({"tokencode": code, "first_owner": "alice", "amount_created": 10.0}),
        }
    }

    fn append(ledger: &Ledger, index: u64, txs: &[Transaction]) -> FinalizedBlock {
        let previous = match index {
            0 => "0".to_string(),
            i => ledger.get_block(i - 1).unwrap().unwrap().hash,
        };
        let block = FinalizedBlock::new(index, "ts", 1, previous, txs).unwrap();
        ledger.finalize_block(&block, txs).unwrap();
        block
    }

    #[test]
    fn test_open_in_memory() {
        let ledger = Ledger::in_memory().unwrap();
        assert!(ledger.conn.lock().is_autocommit());
        assert_eq!(ledger.last_block_index().unwrap(), None);
    }

    #[test]
    fn test_finalize_and_read_back() {
        let ledger = Ledger::in_memory().unwrap();
        let txs = vec![token_tx("T0", 0)];
        let block = append(&ledger, 0, &txs);

        assert_eq!(ledger.last_block_index().unwrap(), Some(0));
        assert_eq!(ledger.get_block(0).unwrap(), Some(block));
        assert_eq!(ledger.get_transaction("T0").unwrap(), Some(txs[0].clone()));
        assert_eq!(ledger.balance("alice", "T0").unwrap(), 10.0);
        assert_eq!(ledger.balances_by_wallet("alice").unwrap().len(), 1);
        assert_eq!(ledger.balances_by_token("T0").unwrap()[0].wallet_address, "alice");
    }

    #[test]
    fn test_block_must_extend_head() {
        let ledger = Ledger::in_memory().unwrap();
        append(&ledger, 0, &[]);

        let gap = FinalizedBlock::new(2, "ts", 1, ledger.get_block(0).unwrap().unwrap().hash, &[]).unwrap();
        assert!(matches!(ledger.finalize_block(&gap, &[]), Err(LedgerError::InvalidBlock(_))));

        let unlinked = FinalizedBlock::new(1, "ts", 1, "wrong", &[]).unwrap();
        assert!(matches!(ledger.finalize_block(&unlinked, &[]), Err(LedgerError::InvalidBlock(_))));
    }

    #[test]
    fn test_rejected_transaction_rolls_back_block() {
        let ledger = Ledger::in_memory().unwrap();
        append(&ledger, 0, &[token_tx("T0", 0)]);

        // second creation of the same token fails inside the state machine
        let mut dup = token_tx("T0-again", 1);
        dup.specific_data = json!({"tokencode": "T0", "amount_created": 1.0});
        let txs = vec![token_tx("T1", 1), dup];
        let previous = ledger.get_block(0).unwrap().unwrap().hash;
        let block = FinalizedBlock::new(1, "ts", 1, previous, &txs).unwrap();

        assert!(ledger.finalize_block(&block, &txs).is_err());
        assert_eq!(ledger.last_block_index().unwrap(), Some(0));
        assert_eq!(ledger.get_transaction("T1").unwrap(), None);
        assert_eq!(ledger.balance("alice", "T1").unwrap(), 0.0);
    }

    #[test]
    fn test_transactions_hash_checked() {
        let ledger = Ledger::in_memory().unwrap();
        let block = FinalizedBlock::new(0, "ts", 1, "0", &[]).unwrap();
        let txs = vec![token_tx("T0", 0)];
        assert!(matches!(ledger.finalize_block(&block, &txs), Err(LedgerError::InvalidBlock(_))));
    }

    #[test]
    fn test_clear_empties_everything() {
        let ledger = Ledger::in_memory().unwrap();
        append(&ledger, 0, &[token_tx("T0", 0)]);
        ledger.clear().unwrap();

        assert_eq!(ledger.last_block_index().unwrap(), None);
        let chain = ledger.download_chain().unwrap();
        assert!(chain.blocks.is_empty() && chain.transactions.is_empty());
        assert!(ledger.download_state().unwrap().balances.is_empty());
    }

    #[test]
    fn test_get_blocks_skips_missing() {
        let ledger = Ledger::in_memory().unwrap();
        append(&ledger, 0, &[]);
        append(&ledger, 1, &[]);
        let blocks = ledger.get_blocks(&[1, 5, 0]).unwrap();
        let indexes: Vec<u64> = blocks.iter().map(|b| b.block_index).collect();
        assert_eq!(indexes, vec![1, 0]);
    }

    #[test]
    fn test_stale_marker_clear_keeps_newer_marker() {
        let ledger = Ledger::in_memory().unwrap();
        for index in 0..=6 {
            append(&ledger, index, &[]);
        }

        ledger.revert(5).unwrap();
        assert_eq!(ledger.pending_staging_prune().unwrap(), Some(5));
        // a second revert commits before the first one's prune finishes
        ledger.revert(2).unwrap();

        assert!(!ledger.clear_staging_prune_marker(5).unwrap());
        assert_eq!(ledger.pending_staging_prune().unwrap(), Some(2));

        assert!(ledger.clear_staging_prune_marker(2).unwrap());
        assert_eq!(ledger.pending_staging_prune().unwrap(), None);
    }
}
