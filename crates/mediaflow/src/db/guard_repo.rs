//! Guard repository: keyed leases in the `idempotency_guards` table.
//!
//! A row is live while `expires_at_ms > now`. Acquisition is a single upsert
//! that only overwrites an expired row, so two racing acquirers can never
//! both succeed. Release and renew are conditional on the token.

use rusqlite::{params, Connection, OptionalExtension};

use super::DatabaseError;

/// A guard row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRow {
    pub key: String,
    pub token: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Tries to take the lease for `key`. Returns `None` when `token` now owns
/// it, or `Some(existing_token)` when a live lease is held by someone else.
pub fn try_acquire(
    conn: &Connection,
    key: &str,
    token: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<Option<String>, DatabaseError> {
    let expires_at_ms = now_ms.saturating_add(ttl_ms);
    let changed = conn.execute(
        "INSERT INTO idempotency_guards (key, token, acquired_at_ms, expires_at_ms)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET token = excluded.token,
             acquired_at_ms = excluded.acquired_at_ms,
             expires_at_ms = excluded.expires_at_ms
         WHERE idempotency_guards.expires_at_ms <= ?3",
        params![key, token, now_ms, expires_at_ms],
    )?;
    if changed == 1 {
        return Ok(None);
    }

    let holder: String = conn.query_row(
        "SELECT token FROM idempotency_guards WHERE key = ?1",
        params![key],
        |r| r.get(0),
    )?;
    Ok(Some(holder))
}

/// Deletes the lease if `token` still owns it.
pub fn release(conn: &Connection, key: &str, token: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM idempotency_guards WHERE key = ?1 AND token = ?2",
        params![key, token],
    )?;
    Ok(changed == 1)
}

/// Pushes the expiry out to `now + ttl` if `token` still owns the lease.
pub fn renew(
    conn: &Connection,
    key: &str,
    token: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE idempotency_guards SET expires_at_ms = ?3 WHERE key = ?1 AND token = ?2",
        params![key, token, now_ms.saturating_add(ttl_ms)],
    )?;
    Ok(changed == 1)
}

/// Returns the live lease for `key`, if any.
pub fn find_live(
    conn: &Connection,
    key: &str,
    now_ms: i64,
) -> Result<Option<GuardRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT key, token, acquired_at_ms, expires_at_ms FROM idempotency_guards
             WHERE key = ?1 AND expires_at_ms > ?2",
            params![key, now_ms],
            |r| {
                Ok(GuardRow {
                    key: r.get(0)?,
                    token: r.get(1)?,
                    acquired_at_ms: r.get(2)?,
                    expires_at_ms: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Drops the lease for `key` regardless of owner.
pub fn invalidate(conn: &Connection, key: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM idempotency_guards WHERE key = ?1", params![key])?;
    Ok(changed == 1)
}

/// Deletes every expired lease. Returns the number removed.
pub fn purge_expired(conn: &Connection, now_ms: i64) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM idempotency_guards WHERE expires_at_ms <= ?1",
        params![now_ms],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    #[test]
    fn test_acquire_free_key() {
        let db = test_db();
        let held = db
            .with_conn(|conn| try_acquire(conn, "k", "t1", 1_000, 500))
            .unwrap();
        assert!(held.is_none());

        let live = db.with_conn(|conn| find_live(conn, "k", 1_200)).unwrap().unwrap();
        assert_eq!(live.token, "t1");
        assert_eq!(live.expires_at_ms, 1_500);
    }

    #[test]
    fn test_acquire_live_key_reports_holder() {
        let db = test_db();
        db.with_conn(|conn| try_acquire(conn, "k", "t1", 1_000, 500))
            .unwrap();
        let held = db
            .with_conn(|conn| try_acquire(conn, "k", "t2", 1_499, 500))
            .unwrap();
        assert_eq!(held.as_deref(), Some("t1"));
    }

    #[test]
    fn test_acquire_expired_key_takes_over() {
        let db = test_db();
        db.with_conn(|conn| try_acquire(conn, "k", "t1", 1_000, 500))
            .unwrap();
        let held = db
            .with_conn(|conn| try_acquire(conn, "k", "t2", 1_500, 500))
            .unwrap();
        assert!(held.is_none());

        // The previous owner can neither release nor renew the new lease.
        assert!(!db.with_conn(|conn| release(conn, "k", "t1")).unwrap());
        assert!(!db
            .with_conn(|conn| renew(conn, "k", "t1", 1_600, 500))
            .unwrap());
        let live = db.with_conn(|conn| find_live(conn, "k", 1_600)).unwrap().unwrap();
        assert_eq!(live.token, "t2");
    }

    #[test]
    fn test_renew_extends_expiry() {
        let db = test_db();
        db.with_conn(|conn| try_acquire(conn, "k", "t1", 1_000, 500))
            .unwrap();
        assert!(db
            .with_conn(|conn| renew(conn, "k", "t1", 1_400, 500))
            .unwrap());
        let held = db
            .with_conn(|conn| try_acquire(conn, "k", "t2", 1_800, 500))
            .unwrap();
        assert_eq!(held.as_deref(), Some("t1"));
    }

    #[test]
    fn test_release_frees_key() {
        let db = test_db();
        db.with_conn(|conn| try_acquire(conn, "k", "t1", 1_000, 500))
            .unwrap();
        assert!(db.with_conn(|conn| release(conn, "k", "t1")).unwrap());
        assert!(db.with_conn(|conn| find_live(conn, "k", 1_001)).unwrap().is_none());
    }

    #[test]
    fn test_invalidate_and_purge() {
        let db = test_db();
        db.with_conn(|conn| {
            try_acquire(conn, "a", "t", 0, 10)?;
            try_acquire(conn, "b", "t", 0, 10_000)?;
            try_acquire(conn, "c", "t", 0, 10_000)?;
            Ok(())
        })
        .unwrap();

        assert!(db.with_conn(|conn| invalidate(conn, "c")).unwrap());
        assert_eq!(db.with_conn(|conn| purge_expired(conn, 100)).unwrap(), 1);
        assert!(db.with_conn(|conn| find_live(conn, "b", 100)).unwrap().is_some());
    }
}
