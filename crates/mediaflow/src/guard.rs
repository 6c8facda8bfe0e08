//! Idempotency guard: a keyed at-most-once barrier shared by every
//! dispatcher (HTTP restart, sweeper, webhook, worker redelivery).
//!
//! Each acquisition mints a new run token. Release and renew only touch
//! the lease while the caller's token still owns it, so a run resurrected
//! after its lease expired cannot free or extend a newer run's lease.

use std::time::Duration;

use rusqlite::Connection;
use uuid::Uuid;

use crate::db::{guard_repo, now_ms, Database, DatabaseError};

/// Key prefix of the per-job stage runner lease.
pub const STAGE_RUNNER_PREFIX: &str = "stage-runner:";
/// Key prefix of the per-job transcription submission lease.
pub const TRANSCRIPTION_PREFIX: &str = "transcription:";

pub fn stage_runner_key(job_id: &str) -> String {
    format!("{}{}", STAGE_RUNNER_PREFIX, job_id)
}

pub fn transcription_key(job_id: &str) -> String {
    format!("{}{}", TRANSCRIPTION_PREFIX, job_id)
}

/// A lease owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired(Lease),
    /// A live lease exists; `token` identifies its owner.
    Held { token: String },
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Acquires `key` on an already locked connection, for use inside
/// `Database::with_tx` alongside other writes.
pub fn acquire_in(conn: &Connection, key: &str, ttl: Duration) -> Result<Acquire, DatabaseError> {
    let token = Uuid::new_v4().to_string();
    match guard_repo::try_acquire(conn, key, &token, now_ms(), ttl_ms(ttl))? {
        None => Ok(Acquire::Acquired(Lease {
            key: key.to_string(),
            token,
        })),
        Some(holder) => Ok(Acquire::Held { token: holder }),
    }
}

/// Whether `token` owns a live lease on `key`.
pub fn is_current_in(conn: &Connection, key: &str, token: &str) -> Result<bool, DatabaseError> {
    Ok(guard_repo::find_live(conn, key, now_ms())?.is_some_and(|row| row.token == token))
}

/// Durable guard backed by the job database.
#[derive(Clone)]
pub struct IdempotencyGuard {
    db: Database,
}

impl IdempotencyGuard {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<Acquire, DatabaseError> {
        let result = self.db.with_conn(|conn| acquire_in(conn, key, ttl))?;
        if let Acquire::Held { ref token } = result {
            log::debug!("Guard '{}' already held by run {}", key, token);
        }
        Ok(result)
    }

    /// Releases the lease. Returns false when `token` no longer owns it.
    pub fn release(&self, key: &str, token: &str) -> Result<bool, DatabaseError> {
        let released = self
            .db
            .with_conn(|conn| guard_repo::release(conn, key, token))?;
        if !released {
            log::debug!("Guard '{}' not released: run {} no longer owns it", key, token);
        }
        Ok(released)
    }

    pub fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| guard_repo::renew(conn, key, token, now_ms(), ttl_ms(ttl)))
    }

    pub fn is_current(&self, key: &str, token: &str) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| is_current_in(conn, key, token))
    }

    /// Drops the lease whatever its owner. The previous owner's conditional
    /// writes fail from then on.
    pub fn invalidate(&self, key: &str) -> Result<bool, DatabaseError> {
        let dropped = self.db.with_conn(|conn| guard_repo::invalidate(conn, key))?;
        if dropped {
            log::info!("Guard '{}' invalidated", key);
        }
        Ok(dropped)
    }

    pub fn purge_expired(&self) -> Result<usize, DatabaseError> {
        self.db
            .with_conn(|conn| guard_repo::purge_expired(conn, now_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(stage_runner_key("j1"), "stage-runner:j1");
        assert_eq!(transcription_key("j1"), "transcription:j1");
    }

    #[test]
    fn test_second_acquire_sees_first_token() {
        let guard = guard();
        let first = guard.acquire("k", Duration::from_secs(60)).unwrap();
        let Acquire::Acquired(lease) = first else {
            panic!("expected acquisition");
        };
        let second = guard.acquire("k", Duration::from_secs(60)).unwrap();
        assert_eq!(second, Acquire::Held { token: lease.token.clone() });
        assert!(guard.is_current("k", &lease.token).unwrap());
    }

    #[test]
    fn test_zero_ttl_lease_is_immediately_reclaimable() {
        let guard = guard();
        let Acquire::Acquired(stale) = guard.acquire("k", Duration::ZERO).unwrap() else {
            panic!("expected acquisition");
        };
        let Acquire::Acquired(fresh) = guard.acquire("k", Duration::from_secs(60)).unwrap() else {
            panic!("expected takeover of expired lease");
        };
        assert_ne!(stale.token, fresh.token);
        assert!(!guard.release("k", &stale.token).unwrap());
        assert!(guard.is_current("k", &fresh.token).unwrap());
    }

    #[test]
    fn test_invalidate_revokes_owner() {
        let guard = guard();
        let Acquire::Acquired(lease) = guard.acquire("k", Duration::from_secs(60)).unwrap() else {
            panic!("expected acquisition");
        };
        assert!(guard.invalidate("k").unwrap());
        assert!(!guard.is_current("k", &lease.token).unwrap());
        assert!(!guard.renew("k", &lease.token, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let guard = guard();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    guard.acquire("shared", Duration::from_secs(60)).unwrap()
                })
            })
            .collect();

        let results: Vec<Acquire> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<&Lease> = results
            .iter()
            .filter_map(|r| match r {
                Acquire::Acquired(lease) => Some(lease),
                Acquire::Held { .. } => None,
            })
            .collect();
        assert_eq!(winners.len(), 1);
        for r in &results {
            if let Acquire::Held { token } = r {
                assert_eq!(token, &winners[0].token);
            }
        }
    }
}
