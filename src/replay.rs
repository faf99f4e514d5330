//! Revert & Replay Engine
//!
//! Truncates the chain to a target block index, drops the derived tables and
//! rebuilds them by re-applying every retained transaction in order. The whole
//! operation runs inside one SQLite transaction: on any failure the ledger is
//! left exactly as it was before the call.

use crate::error::{LedgerError, Result};
use crate::ledger::{load_transaction_rows, schema, to_sql_index};
use crate::state::StateTransition;
use crate::transaction::TransactionType;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

/// Deepest string-in-string nesting accepted when decoding a stored payload.
pub const MAX_PAYLOAD_DECODE_DEPTH: usize = 8;

/// Decodes a stored `specific_data` column.
///
/// Older writers stored the payload JSON-encoded more than once, so the
/// value is decoded repeatedly while it is still a string that parses as
/// JSON. A string that does not parse is the payload itself.
pub fn decode_specific_data(raw: &str) -> Result<Value> {
    let mut value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ok(Value::String(raw.to_string())),
    };

    for _ in 0..MAX_PAYLOAD_DECODE_DEPTH {
        let inner = match &value {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(inner) => inner,
                Err(_) => return Ok(value),
            },
            _ => return Ok(value),
        };
        value = inner;
    }

    if value.is_string() {
        return Err(LedgerError::InvalidTransaction(format!(
            "specific_data nested deeper than {} encodings",
            MAX_PAYLOAD_DECODE_DEPTH
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertReport {
    pub target_index: u64,
    pub blocks_removed: usize,
    pub transactions_removed: usize,
    pub transactions_replayed: usize,
}

/// Reverts `conn` to `target_index` and replays the retained log through
/// `transition`.
///
/// On success the `pending_staging_prune` marker is committed along with the
/// new state; the caller prunes staged files and then clears it.
pub fn revert_chain(
    conn: &mut Connection,
    transition: &dyn StateTransition,
    target_index: u64,
) -> Result<RevertReport> {
    info!(target_index, "reverting chain");
    let target = to_sql_index(target_index);

    // an immediate transaction takes the write lock up front
    let db = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let blocks_removed = db.execute("DELETE FROM blocks WHERE block_index > ?1", params![target])?;
    let transactions_removed =
        db.execute("DELETE FROM transactions WHERE block_index > ?1", params![target])?;

    schema::drop_derived_tables(&db)?;
    schema::create_schema(&db)?;

    let rows = load_transaction_rows(&db, Some(target_index))?;
    let transactions_replayed = rows.len();

    for row in rows {
        let failure = |reason: String| LedgerError::ReplayFailure {
            transaction_code: row.transaction_code.clone(),
            block_index: row.block_index,
            reason,
        };

        let kind = TransactionType::from_code(row.kind).map_err(|e| failure(e.to_string()))?;
        let payload = decode_specific_data(&row.specific_data).map_err(|e| failure(e.to_string()))?;

        if let Err(e) = transition.apply_transaction(&db, kind, &payload, &row.transaction_code, &row.timestamp) {
            let err = failure(e.to_string());
            error!(error = %err, "replay aborted, ledger unchanged");
            // dropping `db` rolls back
            return Err(err);
        }
    }

    schema::set_meta(&db, schema::PENDING_PRUNE_KEY, &target_index.to_string())?;
    db.commit()?;

    let report = RevertReport {
        target_index,
        blocks_removed,
        transactions_removed,
        transactions_replayed,
    };
    info!(
        target_index,
        blocks_removed,
        transactions_removed,
        transactions_replayed,
        "chain reverted"
    );
    Ok(report)
}
