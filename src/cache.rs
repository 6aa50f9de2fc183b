//! The persistent cache: durable fingerprint → result storage shared by
//! every worker that opens the same store file.
//!
//! Three tables: `results` (written exactly once per fingerprint, read-only
//! thereafter), `claims` (the mutual-exclusion layer guaranteeing
//! at-most-one-in-flight execution per fingerprint) and `deps` (parent →
//! child fingerprint hints for external demand analysis; the core writes
//! them alongside results and never reads them back).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8Path;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::codec;
use crate::error::{CodecError, Error, StoreError};
use crate::hash::Hash;
use crate::value::Value;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS results (
    fingerprint BLOB PRIMARY KEY,
    rule        TEXT NOT NULL,
    input_hash  BLOB NOT NULL,
    value       BLOB NOT NULL,
    created     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS claims (
    fingerprint BLOB PRIMARY KEY,
    worker      TEXT NOT NULL,
    heartbeat   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS deps (
    parent BLOB NOT NULL,
    child  BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS deps_parent ON deps (parent);
";

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of a claim attempt for a fingerprint.
pub(crate) enum ClaimOutcome {
    /// This worker now holds the exclusive right to run the task.
    Claimed,
    /// Another worker already published the result.
    Published(Value),
    /// Another worker holds the claim; `age` is its heartbeat age.
    Busy { age: Duration },
}

pub struct Cache {
    conn: Mutex<Connection>,
    worker_id: String,
}

impl Cache {
    /// Open (or create) the store file for a project.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// A private, in-memory store. Handy for tests; claims still work but
    /// are only visible through this instance.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        let worker_id = format!(
            "{}:{}",
            std::process::id(),
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed),
        );
        Ok(Cache {
            conn: Mutex::new(conn),
            worker_id,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn result_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Children recorded for a parent fingerprint in the `deps` hint table.
    pub fn deps_of(&self, parent: &Hash) -> Result<Vec<Hash>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT child FROM deps WHERE parent = ?1")?;
        let rows = stmt.query_map(params![parent.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut children = Vec::new();
        for row in rows {
            let bytes: [u8; 32] = row?.try_into().map_err(|_| {
                CodecError::Decode("fingerprint is not 32 bytes".to_string())
            })?;
            children.push(Hash::from_bytes(bytes));
        }
        Ok(children)
    }

    pub fn has_result(&self, fingerprint: &Hash) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM results WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fetch a result, verifying that the stored entry matches the task's
    /// construction. A divergent entry for the same fingerprint means the
    /// store is inconsistent with this program.
    pub(crate) fn lookup(
        &self,
        fingerprint: &Hash,
        rule_id: &str,
        input_hash: &Hash,
    ) -> Result<Option<Value>, Error> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT rule, input_hash, value FROM results WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(StoreError::from)?;

        let (rule, stored_input, blob) = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        if rule != rule_id || stored_input != input_hash.as_bytes().as_slice() {
            return Err(Error::CacheConflict {
                fingerprint: *fingerprint,
                rule: rule_id.to_string(),
            });
        }
        Ok(Some(codec::decode(&blob).map_err(StoreError::from)?))
    }

    /// Fetch a result by fingerprint alone, for resolving references
    /// embedded inside stored blobs.
    pub(crate) fn lookup_value(&self, fingerprint: &Hash) -> Result<Option<Value>, Error> {
        let conn = self.conn.lock().unwrap();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM results WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        match blob {
            Some(blob) => Ok(Some(codec::decode(&blob).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    /// Try to take the exclusive right to execute a fingerprint.
    ///
    /// The insert happens in one immediate transaction that fails when the
    /// fingerprint already has a result or a live claim, so at most one
    /// worker anywhere can hold it.
    pub(crate) fn try_claim(
        &self,
        fingerprint: &Hash,
        rule_id: &str,
        input_hash: &Hash,
    ) -> Result<ClaimOutcome, Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let result: Option<(String, Vec<u8>, Vec<u8>)> = tx
            .query_row(
                "SELECT rule, input_hash, value FROM results WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(StoreError::from)?;
        if let Some((rule, stored_input, blob)) = result {
            if rule != rule_id || stored_input != input_hash.as_bytes().as_slice() {
                return Err(Error::CacheConflict {
                    fingerprint: *fingerprint,
                    rule: rule_id.to_string(),
                });
            }
            return Ok(ClaimOutcome::Published(
                codec::decode(&blob).map_err(StoreError::from)?,
            ));
        }

        let heartbeat: Option<i64> = tx
            .query_row(
                "SELECT heartbeat FROM claims WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        if let Some(heartbeat) = heartbeat {
            let age = (now_ms() - heartbeat).max(0) as u64;
            return Ok(ClaimOutcome::Busy {
                age: Duration::from_millis(age),
            });
        }

        tx.execute(
            "INSERT INTO claims (fingerprint, worker, heartbeat) VALUES (?1, ?2, ?3)",
            params![
                fingerprint.as_bytes().as_slice(),
                self.worker_id,
                now_ms()
            ],
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;
        debug!(fingerprint = %fingerprint.tag(), "claim acquired");
        Ok(ClaimOutcome::Claimed)
    }

    /// Take over a claim whose heartbeat is older than `threshold`.
    pub(crate) fn reclaim_if_stale(
        &self,
        fingerprint: &Hash,
        threshold: Duration,
    ) -> Result<bool, Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let cutoff = now_ms() - threshold.as_millis() as i64;
        let taken = tx
            .execute(
                "UPDATE claims SET worker = ?1, heartbeat = ?2
                 WHERE fingerprint = ?3 AND heartbeat < ?4",
                params![
                    self.worker_id,
                    now_ms(),
                    fingerprint.as_bytes().as_slice(),
                    cutoff
                ],
            )
            .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;
        if taken > 0 {
            debug!(fingerprint = %fingerprint.tag(), "stale claim reclaimed");
        }
        Ok(taken > 0)
    }

    /// Write the result and drop the claim in one transaction, plus the
    /// dependency hint rows.
    pub(crate) fn publish(
        &self,
        fingerprint: &Hash,
        rule_id: &str,
        input_hash: &Hash,
        value: &Value,
        children: &[Hash],
    ) -> Result<(), Error> {
        let blob = codec::encode(value).map_err(StoreError::from)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        tx.execute(
            "INSERT OR IGNORE INTO results
                 (fingerprint, rule, input_hash, value, created)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fingerprint.as_bytes().as_slice(),
                rule_id,
                input_hash.as_bytes().as_slice(),
                blob,
                now_ms()
            ],
        )
        .map_err(StoreError::from)?;
        tx.execute(
            "DELETE FROM claims WHERE fingerprint = ?1 AND worker = ?2",
            params![fingerprint.as_bytes().as_slice(), self.worker_id],
        )
        .map_err(StoreError::from)?;
        for child in children {
            tx.execute(
                "INSERT INTO deps (parent, child) VALUES (?1, ?2)",
                params![
                    fingerprint.as_bytes().as_slice(),
                    child.as_bytes().as_slice()
                ],
            )
            .map_err(StoreError::from)?;
        }
        tx.commit().map_err(StoreError::from)?;
        debug!(fingerprint = %fingerprint.tag(), "result published");
        Ok(())
    }

    /// Drop a claim without publishing. Errors are not persisted.
    pub(crate) fn release(&self, fingerprint: &Hash) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM claims WHERE fingerprint = ?1 AND worker = ?2",
            params![fingerprint.as_bytes().as_slice(), self.worker_id],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    /// Refresh heartbeats on every claim this worker holds.
    pub(crate) fn refresh(&self, held: &HashSet<Hash>) -> Result<(), Error> {
        if held.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        for fingerprint in held {
            conn.execute(
                "UPDATE claims SET heartbeat = ?1
                 WHERE fingerprint = ?2 AND worker = ?3",
                params![now, fingerprint.as_bytes().as_slice(), self.worker_id],
            )
            .map_err(StoreError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> Hash {
        Hash::digest([n])
    }

    #[test]
    fn worker_identities_are_distinct_per_instance() {
        let a = Cache::in_memory().unwrap();
        let b = Cache::in_memory().unwrap();
        assert_ne!(a.worker_id(), b.worker_id());
    }

    #[test]
    fn publish_then_lookup() {
        let cache = Cache::in_memory().unwrap();
        let f = fp(1);
        let input = fp(2);

        assert!(matches!(
            cache.try_claim(&f, "fib@v0", &input).unwrap(),
            ClaimOutcome::Claimed
        ));
        cache
            .publish(&f, "fib@v0", &input, &Value::Int(5), &[fp(3)])
            .unwrap();

        let value = cache.lookup(&f, "fib@v0", &input).unwrap();
        assert_eq!(value, Some(Value::Int(5)));
        assert_eq!(cache.result_count().unwrap(), 1);
        assert_eq!(cache.deps_of(&f).unwrap(), vec![fp(3)]);
        assert_eq!(cache.deps_of(&fp(3)).unwrap(), vec![]);
    }

    #[test]
    fn divergent_entry_is_a_conflict() {
        let cache = Cache::in_memory().unwrap();
        let f = fp(1);
        let input = fp(2);
        cache.try_claim(&f, "fib@v0", &input).unwrap();
        cache
            .publish(&f, "fib@v0", &input, &Value::Int(5), &[])
            .unwrap();

        assert!(matches!(
            cache.lookup(&f, "other@v0", &input),
            Err(Error::CacheConflict { .. })
        ));
        assert!(matches!(
            cache.try_claim(&f, "fib@v0", &fp(9)),
            Err(Error::CacheConflict { .. })
        ));
    }

    #[test]
    fn second_claim_is_busy_until_released() {
        let cache = Cache::in_memory().unwrap();
        let f = fp(1);
        let input = fp(2);

        assert!(matches!(
            cache.try_claim(&f, "fib@v0", &input).unwrap(),
            ClaimOutcome::Claimed
        ));
        assert!(matches!(
            cache.try_claim(&f, "fib@v0", &input).unwrap(),
            ClaimOutcome::Busy { .. }
        ));

        cache.release(&f).unwrap();
        assert!(matches!(
            cache.try_claim(&f, "fib@v0", &input).unwrap(),
            ClaimOutcome::Claimed
        ));
    }

    #[test]
    fn claim_after_publish_returns_the_result() {
        let cache = Cache::in_memory().unwrap();
        let f = fp(1);
        let input = fp(2);
        cache.try_claim(&f, "fib@v0", &input).unwrap();
        cache
            .publish(&f, "fib@v0", &input, &Value::Int(5), &[])
            .unwrap();

        match cache.try_claim(&f, "fib@v0", &input).unwrap() {
            ClaimOutcome::Published(value) => assert_eq!(value, Value::Int(5)),
            _ => panic!("expected the published result"),
        }
    }

    #[test]
    fn fresh_claims_are_not_stale() {
        let cache = Cache::in_memory().unwrap();
        let f = fp(1);
        cache.try_claim(&f, "fib@v0", &fp(2)).unwrap();
        assert!(!cache
            .reclaim_if_stale(&f, Duration::from_secs(60))
            .unwrap());
    }

    #[test]
    fn stale_claims_can_be_taken_over() {
        let cache = Cache::in_memory().unwrap();
        let f = fp(1);
        cache.try_claim(&f, "fib@v0", &fp(2)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache
            .reclaim_if_stale(&f, Duration::from_millis(1))
            .unwrap());
    }
}
