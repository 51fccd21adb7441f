//! Persisted per-peer high-water marks

use std::collections::HashMap;

use rusqlite::{params, Connection};

use super::sql_ts;
use crate::error::Result;
use crate::types::Timestamp;

/// Store the mark for `address`. Marks never move backwards.
pub fn save_peer_mark(conn: &Connection, address: &str, mark: Timestamp, now: Timestamp) -> Result<()> {
    conn.execute(
        "INSERT INTO peer_sync_state (address, last_local_timestamp, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(address) DO UPDATE SET
            last_local_timestamp = MAX(last_local_timestamp, excluded.last_local_timestamp),
            updated_at = excluded.updated_at",
        params![address, sql_ts(mark), sql_ts(now)],
    )?;
    Ok(())
}

pub fn load_peer_marks(conn: &Connection) -> Result<HashMap<String, Timestamp>> {
    let mut stmt = conn.prepare("SELECT address, last_local_timestamp FROM peer_sync_state")?;
    let marks = stmt
        .query_map([], |row| {
            let mark: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, mark.max(0) as Timestamp))
        })?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(marks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ContentDb;

    #[test]
    fn test_marks_are_monotonic() {
        let db = ContentDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            save_peer_mark(conn, "http://a", 100, 1)?;
            save_peer_mark(conn, "http://a", 50, 2)?;
            save_peer_mark(conn, "http://b", 7, 3)?;

            let marks = load_peer_marks(conn)?;
            assert_eq!(marks.get("http://a"), Some(&100));
            assert_eq!(marks.get("http://b"), Some(&7));
            Ok(())
        })
        .unwrap();
    }
}
