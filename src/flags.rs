//! Session-scoped refresh flags.
//!
//! A flag is raised by the operation that invalidates some view (an order
//! completed, a table changed hands) and taken by the view that needs to
//! refetch. Flags live until taken or until the login session ends.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::db::DbState;

pub const ORDER_COMPLETED: &str = "order_completed";
pub const TABLES_DIRTY: &str = "tables_dirty";
pub const SHIFT_TOTALS_DIRTY: &str = "shift_totals_dirty";
pub const ORDERS_DIRTY: &str = "orders_dirty";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagRecord {
    pub flag: String,
    pub raised_at: String,
    pub payload: Option<Value>,
}

/// Raise (or re-raise) a flag. A later raise replaces the payload.
pub fn raise(db: &DbState, flag: &str, payload: Option<Value>) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let payload_text = payload.map(|p| p.to_string());
    conn.execute(
        "INSERT INTO session_flags (flag, raised_at, payload) VALUES (?1, ?2, ?3)
         ON CONFLICT(flag) DO UPDATE SET raised_at = excluded.raised_at, payload = excluded.payload",
        params![flag, Utc::now().to_rfc3339(), payload_text],
    )
    .map_err(|e| format!("raise flag {flag}: {e}"))?;
    debug!(flag, "session flag raised");
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlagRecord> {
    let payload: Option<String> = row.get(2)?;
    Ok(FlagRecord {
        flag: row.get(0)?,
        raised_at: row.get(1)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
    })
}

/// Read a flag without clearing it.
pub fn peek(db: &DbState, flag: &str) -> Result<Option<FlagRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT flag, raised_at, payload FROM session_flags WHERE flag = ?1",
        params![flag],
        record_from_row,
    )
    .optional()
    .map_err(|e| format!("peek flag {flag}: {e}"))
}

/// Read and clear a flag in one statement, so a raise from another process
/// lands either before (and is returned) or after (and stays raised).
pub fn take(db: &DbState, flag: &str) -> Result<Option<FlagRecord>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let record = conn
        .query_row(
            "DELETE FROM session_flags WHERE flag = ?1 RETURNING flag, raised_at, payload",
            params![flag],
            record_from_row,
        )
        .optional()
        .map_err(|e| format!("take flag {flag}: {e}"))?;
    if record.is_some() {
        debug!(flag, "session flag taken");
    }
    Ok(record)
}

/// Drop every flag (login and logout start a fresh session).
pub fn clear_all(db: &DbState) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute("DELETE FROM session_flags", [])
        .map_err(|e| format!("clear flags: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    #[test]
    fn take_clears_flag() {
        let db = db::open_in_memory_for_test();
        raise(&db, TABLES_DIRTY, Some(json!({ "tableId": "t1" }))).unwrap();

        let first = take(&db, TABLES_DIRTY).unwrap().expect("flag raised");
        assert_eq!(first.payload, Some(json!({ "tableId": "t1" })));
        assert!(take(&db, TABLES_DIRTY).unwrap().is_none());
    }

    #[test]
    fn reraise_replaces_payload_and_peek_keeps_flag() {
        let db = db::open_in_memory_for_test();
        raise(&db, ORDER_COMPLETED, Some(json!({ "orderId": "a" }))).unwrap();
        raise(&db, ORDER_COMPLETED, Some(json!({ "orderId": "b" }))).unwrap();

        let seen = peek(&db, ORDER_COMPLETED).unwrap().unwrap();
        assert_eq!(seen.payload, Some(json!({ "orderId": "b" })));
        assert!(peek(&db, ORDER_COMPLETED).unwrap().is_some());
    }

    #[test]
    fn clear_all_drops_every_flag() {
        let db = db::open_in_memory_for_test();
        raise(&db, ORDER_COMPLETED, None).unwrap();
        raise(&db, SHIFT_TOTALS_DIRTY, None).unwrap();
        clear_all(&db).unwrap();
        assert!(peek(&db, ORDER_COMPLETED).unwrap().is_none());
        assert!(peek(&db, SHIFT_TOTALS_DIRTY).unwrap().is_none());
    }

    #[test]
    fn raise_from_another_connection_after_take_stays_raised() {
        let dir = tempfile::tempdir().unwrap();
        let register = db::init(dir.path()).unwrap();
        let back_office = db::init(dir.path()).unwrap();

        raise(&register, TABLES_DIRTY, Some(json!({ "tableId": "t1" }))).unwrap();
        let taken = take(&back_office, TABLES_DIRTY).unwrap().unwrap();
        assert_eq!(taken.payload, Some(json!({ "tableId": "t1" })));

        raise(&register, TABLES_DIRTY, Some(json!({ "tableId": "t2" }))).unwrap();
        let next = take(&back_office, TABLES_DIRTY).unwrap().unwrap();
        assert_eq!(next.payload, Some(json!({ "tableId": "t2" })));
        assert!(peek(&register, TABLES_DIRTY).unwrap().is_none());
    }
}
