//! State-transition function: applies one transaction to the derived tables

use crate::error::{LedgerError, Result};
use crate::transaction::{SpecificData, TokenPayload, TransactionType, WalletPayload};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

/// Mutates `wallets`, `tokens` and `balances` through `db` for one transaction.
///
/// Called both when a block is finalized and when the log is replayed after a
/// revert, so it must be a pure function of the transaction and the current
/// derived state.
pub trait StateTransition: Send + Sync {
    fn apply_transaction(
        &self,
        db: &Connection,
        kind: TransactionType,
        payload: &Value,
        transaction_code: &str,
        timestamp: &str,
    ) -> Result<()>;
}

/// Default state machine for wallet, token and transfer transactions.
/// Contract calls and trust-score updates leave the derived tables untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerStateMachine;

impl StateTransition for LedgerStateMachine {
    fn apply_transaction(
        &self,
        db: &Connection,
        kind: TransactionType,
        payload: &Value,
        transaction_code: &str,
        _timestamp: &str,
    ) -> Result<()> {
        match SpecificData::parse(kind, payload)? {
            SpecificData::AddWallet(wallet) => add_wallet(db, &wallet),
            SpecificData::CreateToken(token) => create_token(db, &token, transaction_code),
            SpecificData::Transfer { two_way, payload: transfer } => {
                move_balance(db, &transfer.asset1_code, &transfer.wallet1, &transfer.wallet2, transfer.asset1_number)?;
                if two_way {
                    let asset2 = transfer.asset2_code.as_deref().ok_or_else(|| {
                        LedgerError::InvalidTransaction(format!(
                            "Two-way transfer {} has no asset2_code",
                            transaction_code
                        ))
                    })?;
                    move_balance(db, asset2, &transfer.wallet2, &transfer.wallet1, transfer.asset2_number)?;
                }
                Ok(())
            }
            SpecificData::ContractCall(_) | SpecificData::TrustScore(_) => {
                debug!(transaction_code, kind = %kind, "no derived state change");
                Ok(())
            }
        }
    }
}

fn json_text(value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(value)?))
}

fn add_wallet(db: &Connection, wallet: &WalletPayload) -> Result<()> {
    db.execute(
        "INSERT OR IGNORE INTO wallets
            (wallet_address, wallet_public, custodian_wallet, kyc_docs, owner_type, jurisdiction, specific_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            wallet.wallet_address,
            wallet.wallet_public,
            wallet.custodian_wallet,
            json_text(&wallet.kyc_docs)?,
            wallet.owner_type,
            wallet.jurisdiction,
            json_text(&wallet.specific_data)?,
        ],
    )?;
    Ok(())
}

fn token_exists(db: &Connection, tokencode: &str) -> Result<bool> {
    Ok(db
        .query_row(
            "SELECT 1 FROM tokens WHERE tokencode = ?1",
            params![tokencode],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn create_token(db: &Connection, token: &TokenPayload, transaction_code: &str) -> Result<()> {
    if token_exists(db, &token.tokencode)? {
        return Err(LedgerError::InvalidTransaction(format!(
            "Token {} already exists",
            token.tokencode
        )));
    }
    if token.amount_created < 0.0 {
        return Err(LedgerError::InvalidTransaction(format!(
            "Token {} created with negative amount",
            token.tokencode
        )));
    }

    db.execute(
        "INSERT INTO tokens
            (tokencode, tokenname, tokentype, first_owner, custodian, legaldochash, amount_created,
             value_created, sc_flag, disallowed, tokendecimal, parent_transaction_code, token_attributes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            token.tokencode,
            token.tokenname,
            token.tokentype,
            token.first_owner,
            token.custodian,
            token.legaldochash,
            token.amount_created,
            token.value_created,
            token.sc_flag as i64,
            json_text(&token.disallowed)?,
            token.tokendecimal,
            transaction_code,
            json_text(&token.token_attributes)?,
        ],
    )?;

    if let Some(owner) = &token.first_owner {
        if token.amount_created > 0.0 {
            credit(db, owner, &token.tokencode, token.amount_created)?;
        }
    }
    Ok(())
}

pub(crate) fn balance_of(db: &Connection, wallet: &str, tokencode: &str) -> Result<f64> {
    Ok(db
        .query_row(
            "SELECT balance FROM balances WHERE wallet_address = ?1 AND tokencode = ?2",
            params![wallet, tokencode],
            |row| row.get::<_, f64>(0),
        )
        .optional()?
        .unwrap_or(0.0))
}

fn credit(db: &Connection, wallet: &str, tokencode: &str, amount: f64) -> Result<()> {
    db.execute(
        "INSERT INTO balances (wallet_address, tokencode, balance) VALUES (?1, ?2, ?3)
         ON CONFLICT (wallet_address, tokencode) DO UPDATE SET balance = balance + excluded.balance",
        params![wallet, tokencode, amount],
    )?;
    Ok(())
}

fn move_balance(db: &Connection, tokencode: &str, from: &str, to: &str, amount: f64) -> Result<()> {
    if amount < 0.0 {
        return Err(LedgerError::InvalidTransaction(format!(
            "Negative transfer amount {} of {}",
            amount, tokencode
        )));
    }
    if !token_exists(db, tokencode)? {
        return Err(LedgerError::InvalidTransaction(format!("Unknown token {}", tokencode)));
    }

    let available = balance_of(db, from, tokencode)?;
    if available < amount {
        return Err(LedgerError::InvalidTransaction(format!(
            "Insufficient {} balance in {}: have {}, need {}",
            tokencode, from, available, amount
        )));
    }

    db.execute(
        "UPDATE balances SET balance = balance - ?3 WHERE wallet_address = ?1 AND tokencode = ?2",
        params![from, tokencode, amount],
    )?;
    credit(db, to, tokencode, amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::schema;
    use serde_json::json;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_schema(&conn).unwrap();
        conn
    }

    fn apply(conn: &Connection, kind: TransactionType, payload: Value, code: &str) -> Result<()> {
        LedgerStateMachine.apply_transaction(conn, kind, &payload, code, "t")
    }

    fn mint(conn: &Connection) {
        apply(
            conn,
            TransactionType::CreateToken,
            json!({"tokencode": "GOLD", "first_owner": "alice", "amount_created": 100.0}),
            "mint",
        )
        .unwrap();
    }

    #[test]
    fn test_token_creation_credits_first_owner() {
        let conn = db();
        mint(&conn);
        assert_eq!(balance_of(&conn, "alice", "GOLD").unwrap(), 100.0);

        let parent: String = conn
            .query_row("SELECT parent_transaction_code FROM tokens WHERE tokencode = 'GOLD'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(parent, "mint");
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let conn = db();
        mint(&conn);
        let again = apply(
            &conn,
            TransactionType::CreateToken,
            json!({"tokencode": "GOLD", "amount_created": 1.0}),
            "mint-2",
        );
        assert!(matches!(again, Err(LedgerError::InvalidTransaction(_))));
    }

    #[test]
    fn test_one_way_transfer_moves_balance() {
        let conn = db();
        mint(&conn);
        apply(
            &conn,
            TransactionType::OneWayTransfer,
            json!({"asset1_code": "GOLD", "wallet1": "alice", "wallet2": "bob", "asset1_number": 30.0}),
            "t1",
        )
        .unwrap();

        assert_eq!(balance_of(&conn, "alice", "GOLD").unwrap(), 70.0);
        assert_eq!(balance_of(&conn, "bob", "GOLD").unwrap(), 30.0);
    }

    #[test]
    fn test_two_way_transfer_swaps_assets() {
        let conn = db();
        mint(&conn);
        apply(
            &conn,
            TransactionType::CreateToken,
            json!({"tokencode": "SILVER", "first_owner": "bob", "amount_created": 50.0}),
            "mint-s",
        )
        .unwrap();
        apply(
            &conn,
            TransactionType::TwoWayTransfer,
            json!({
                "asset1_code": "GOLD", "asset2_code": "SILVER",
                "wallet1": "alice", "wallet2": "bob",
                "asset1_number": 10.0, "asset2_number": 20.0
            }),
            "swap",
        )
        .unwrap();

        assert_eq!(balance_of(&conn, "bob", "GOLD").unwrap(), 10.0);
        assert_eq!(balance_of(&conn, "alice", "SILVER").unwrap(), 20.0);
        assert_eq!(balance_of(&conn, "bob", "SILVER").unwrap(), 30.0);
    }

    #[test]
    fn test_overdraft_rejected() {
        let conn = db();
        mint(&conn);
        let result = apply(
            &conn,
            TransactionType::OneWayTransfer,
            json!({"asset1_code": "GOLD", "wallet1": "bob", "wallet2": "alice", "asset1_number": 1.0}),
            "t1",
        );
        assert!(result.is_err());
        assert_eq!(balance_of(&conn, "alice", "GOLD").unwrap(), 100.0);
    }

    #[test]
    fn test_wallet_and_passive_types() {
        let conn = db();
        apply(
            &conn,
            TransactionType::AddWallet,
            json!({"wallet_address": "w1", "custodian_wallet": "c", "kyc_docs": [{"type": 1}], "ownertype": 1}),
            "w",
        )
        .unwrap();
        apply(
            &conn,
            TransactionType::TrustScoreUpdate,
            json!({"address1": "a", "address2": "b", "new_score": 0.5}),
            "ts",
        )
        .unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM wallets", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        let owner_type: i64 = conn
            .query_row("SELECT owner_type FROM wallets WHERE wallet_address = 'w1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(owner_type, 1);
    }
}
