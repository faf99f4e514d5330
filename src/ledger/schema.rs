//! Ledger table definitions.
//!
//! `blocks` and `transactions` are the durable log. `wallets`, `tokens` and
//! `balances` are derived: they are only ever written by the state-transition
//! function and can be dropped and rebuilt by replay.

use rusqlite::{params, Connection, OptionalExtension};

pub const LOG_TABLES: [&str; 2] = ["blocks", "transactions"];
pub const DERIVED_TABLES: [&str; 3] = ["wallets", "tokens", "balances"];

/// Key of the marker a committed revert leaves until staged files above the
/// target index have been pruned.
pub const PENDING_PRUNE_KEY: &str = "pending_staging_prune";

const CREATE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS wallets (
        wallet_address TEXT NOT NULL PRIMARY KEY,
        wallet_public TEXT,
        wallet_private TEXT,
        custodian_wallet TEXT,
        kyc_docs TEXT,
        owner_type INTEGER,
        jurisdiction INTEGER,
        specific_data TEXT
    );

    CREATE TABLE IF NOT EXISTS tokens (
        tokencode TEXT NOT NULL PRIMARY KEY,
        tokenname TEXT,
        tokentype INTEGER,
        first_owner TEXT,
        custodian TEXT,
        legaldochash TEXT,
        amount_created REAL,
        value_created REAL,
        sc_flag INTEGER,
        disallowed TEXT,
        tokendecimal INTEGER,
        parent_transaction_code TEXT,
        token_attributes TEXT
    );

    CREATE TABLE IF NOT EXISTS balances (
        wallet_address TEXT,
        tokencode TEXT,
        balance REAL,
        UNIQUE (wallet_address, tokencode)
    );

    CREATE TABLE IF NOT EXISTS blocks (
        block_index INTEGER PRIMARY KEY,
        timestamp TEXT,
        proof INTEGER,
        previous_hash TEXT,
        hash TEXT,
        transactions_hash TEXT
    );

    CREATE TABLE IF NOT EXISTS transactions (
        transaction_code TEXT PRIMARY KEY,
        block_index INTEGER,
        timestamp TEXT,
        type INTEGER,
        currency TEXT,
        fee REAL,
        description TEXT,
        valid INTEGER,
        specific_data TEXT
    );

    CREATE TABLE IF NOT EXISTS ledger_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_SCHEMA)
}

pub fn drop_derived_tables(conn: &Connection) -> rusqlite::Result<()> {
    for table in DERIVED_TABLES {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
    }
    Ok(())
}

pub fn drop_all(conn: &Connection) -> rusqlite::Result<()> {
    drop_derived_tables(conn)?;
    for table in LOG_TABLES.iter().chain(["ledger_meta"].iter()) {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
    }
    Ok(())
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ledger_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM ledger_meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

/// Deletes `key` only while it still holds `value`. Returns whether a row went.
pub fn delete_meta_if(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM ledger_meta WHERE key = ?1 AND value = ?2",
        params![key, value],
    )?;
    Ok(deleted > 0)
}
