//! Dispatch queue repository: durable at-least-once delivery of stage runner
//! triggers.
//!
//! A pending row is visible once `visible_at_ms <= now`. Claiming a row
//! pushes `visible_at_ms` out by the lease, so a worker that dies mid-run
//! leaves the row to be redelivered after the lease runs out.

use rusqlite::{params, Connection, OptionalExtension};

use super::DatabaseError;

/// A claimed queue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub job_id: String,
    pub run_token: String,
    pub payload: String,
    /// Number of times this row has been claimed, including this one.
    pub attempts: u32,
}

/// Appends a trigger, visible immediately.
pub fn push(
    conn: &Connection,
    job_id: &str,
    run_token: &str,
    payload: &str,
    now_ms: i64,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO dispatch_queue (job_id, run_token, payload, status, visible_at_ms, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
        params![job_id, run_token, payload, now_ms, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Claims the oldest visible pending row and hides it for `lease_ms`.
pub fn claim_next(
    conn: &Connection,
    now_ms: i64,
    lease_ms: i64,
) -> Result<Option<Delivery>, DatabaseError> {
    let delivery = conn
        .query_row(
            "UPDATE dispatch_queue SET attempts = attempts + 1, visible_at_ms = ?2
             WHERE id = (
                 SELECT id FROM dispatch_queue
                 WHERE status = 'pending' AND visible_at_ms <= ?1
                 ORDER BY id LIMIT 1)
             RETURNING id, job_id, run_token, payload, attempts",
            params![now_ms, now_ms.saturating_add(lease_ms)],
            |r| {
                Ok(Delivery {
                    id: r.get(0)?,
                    job_id: r.get(1)?,
                    run_token: r.get(2)?,
                    payload: r.get(3)?,
                    attempts: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(delivery)
}

/// Keeps a claimed row hidden for another `lease_ms`.
pub fn extend(
    conn: &Connection,
    id: i64,
    now_ms: i64,
    lease_ms: i64,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE dispatch_queue SET visible_at_ms = ?2 WHERE id = ?1 AND status = 'pending'",
        params![id, now_ms.saturating_add(lease_ms)],
    )?;
    Ok(changed == 1)
}

/// Marks a row delivered.
pub fn complete(conn: &Connection, id: i64) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE dispatch_queue SET status = 'done' WHERE id = ?1 AND status = 'pending'",
        params![id],
    )?;
    Ok(changed == 1)
}

/// Gives up on a row after too many deliveries.
pub fn bury(conn: &Connection, id: i64, error: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE dispatch_queue SET status = 'dead', last_error = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, error],
    )?;
    Ok(changed == 1)
}

/// Number of rows still waiting for (re)delivery.
pub fn pending_count(conn: &Connection) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM dispatch_queue WHERE status = 'pending'",
        [],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Pending rows for one job, used to tell whether a run is still queued.
pub fn pending_for_job(conn: &Connection, job_id: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM dispatch_queue WHERE status = 'pending' AND job_id = ?1",
        params![job_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{job_repo, Database};
    use crate::job::{ArtifactKind, ProcessingJob};

    fn test_db_with_job() -> (Database, String) {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let job = ProcessingJob::new(ArtifactKind::AudioUpload);
        db.with_conn(|conn| job_repo::insert(conn, &job)).unwrap();
        (db, job.id)
    }

    #[test]
    fn test_claim_in_fifo_order() {
        let (db, job_id) = test_db_with_job();
        db.with_conn(|conn| {
            push(conn, &job_id, "t1", "{}", 100)?;
            push(conn, &job_id, "t2", "{}", 100)?;
            Ok(())
        })
        .unwrap();

        let first = db
            .with_conn(|conn| claim_next(conn, 100, 1_000))
            .unwrap()
            .unwrap();
        let second = db
            .with_conn(|conn| claim_next(conn, 100, 1_000))
            .unwrap()
            .unwrap();
        assert_eq!(first.run_token, "t1");
        assert_eq!(second.run_token, "t2");
        assert_eq!(first.attempts, 1);
        assert!(db
            .with_conn(|conn| claim_next(conn, 100, 1_000))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unacknowledged_row_is_redelivered_after_lease() {
        let (db, job_id) = test_db_with_job();
        db.with_conn(|conn| push(conn, &job_id, "t1", "{}", 0))
            .unwrap();
        db.with_conn(|conn| claim_next(conn, 0, 500)).unwrap().unwrap();

        assert!(db
            .with_conn(|conn| claim_next(conn, 499, 500))
            .unwrap()
            .is_none());
        let again = db
            .with_conn(|conn| claim_next(conn, 500, 500))
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_extend_postpones_redelivery() {
        let (db, job_id) = test_db_with_job();
        let id = db
            .with_conn(|conn| push(conn, &job_id, "t1", "{}", 0))
            .unwrap();
        db.with_conn(|conn| claim_next(conn, 0, 500)).unwrap();
        assert!(db.with_conn(|conn| extend(conn, id, 400, 500)).unwrap());
        assert!(db
            .with_conn(|conn| claim_next(conn, 600, 500))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_complete_and_bury_remove_from_pending() {
        let (db, job_id) = test_db_with_job();
        let (a, b) = db
            .with_conn(|conn| {
                Ok((
                    push(conn, &job_id, "t1", "{}", 0)?,
                    push(conn, &job_id, "t2", "{}", 0)?,
                ))
            })
            .unwrap();
        assert_eq!(db.with_conn(pending_count).unwrap(), 2);
        assert_eq!(
            db.with_conn(|conn| pending_for_job(conn, &job_id)).unwrap(),
            2
        );

        assert!(db.with_conn(|conn| complete(conn, a)).unwrap());
        assert!(db.with_conn(|conn| bury(conn, b, "too many deliveries")).unwrap());
        assert!(!db.with_conn(|conn| complete(conn, b)).unwrap());
        assert_eq!(db.with_conn(pending_count).unwrap(), 0);
    }
}
