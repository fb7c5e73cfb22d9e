use crate::{LeaseError, LeaseResult, PoolLedgerRecord, SpaceReservationRecord, SpaceToken};
use log::*;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

/// Result of locking the available remainder of a reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct LockedReservationInfo {
    pub token: SpaceToken,
    pub pool_name: String,
    /// Bytes moved from available to locked by this call.
    pub locked_now: u64,
    pub creation_time: u64,
    pub expiration: u64,
}

fn db_err(what: &str, e: rusqlite::Error) -> LeaseError {
    warn!("Space db {} failed: {}", what, e);
    LeaseError::DbError(e.to_string())
}

/// Durable store for space reservations, the per-pool ledger and the token
/// counter. Every accounting primitive is one write transaction so the
/// read, validate and apply steps cannot interleave with another writer.
/// Invariant on every row and every ledger entry: 0 <= locked <= reserved.
pub struct SpaceDb {
    conn: Mutex<Connection>,
}

impl SpaceDb {
    pub fn new(db_path: &Path) -> LeaseResult<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            error!("Failed to open space db at {:?}: {}", db_path, e);
            LeaseError::DbError(e.to_string())
        })?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS next_space_token (
                next_token INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pool_space (
                pool_name TEXT PRIMARY KEY,
                reserved INTEGER NOT NULL,
                locked INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS space_reservations (
                space_token INTEGER PRIMARY KEY,
                reserved INTEGER NOT NULL,
                locked INTEGER NOT NULL,
                creation_time INTEGER NOT NULL,
                lifetime INTEGER NOT NULL,
                pool_name TEXT NOT NULL,
                path TEXT NOT NULL,
                created_entry INTEGER NOT NULL,
                utilized INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_space_reservations_pool
                ON space_reservations (pool_name);
            CREATE INDEX IF NOT EXISTS idx_space_reservations_path
                ON space_reservations (path);",
        )
        .map_err(|e| {
            error!("Failed to create space tables: {}", e);
            LeaseError::DbError(e.to_string())
        })?;

        conn.execute(
            "INSERT INTO next_space_token (next_token)
             SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM next_space_token)",
            [],
        )
        .map_err(|e| db_err("seed token counter", e))?;

        Ok(SpaceDb {
            conn: Mutex::new(conn),
        })
    }

    fn with_tx<T>(
        &self,
        what: &str,
        f: impl FnOnce(&Transaction) -> LeaseResult<T>,
    ) -> LeaseResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_err(what, e))?;
        let result = f(&tx)?;
        tx.commit().map_err(|e| db_err(what, e))?;
        Ok(result)
    }

    fn load_row(tx: &Transaction, token: SpaceToken) -> LeaseResult<SpaceReservationRecord> {
        tx.query_row(
            "SELECT space_token, reserved, locked, creation_time, lifetime,
                    pool_name, path, created_entry, utilized
             FROM space_reservations WHERE space_token = ?1",
            params![token],
            row_to_record,
        )
        .optional()
        .map_err(|e| db_err("load reservation", e))?
        .ok_or_else(|| LeaseError::NotFound(format!("no space reservation with token {}", token)))
    }

    fn apply_row_lock(
        tx: &Transaction,
        record: &SpaceReservationRecord,
        amount: i64,
    ) -> LeaseResult<()> {
        tx.execute(
            "UPDATE space_reservations SET locked = locked + ?1 WHERE space_token = ?2",
            params![amount, record.token],
        )
        .map_err(|e| db_err("lock reservation", e))?;
        tx.execute(
            "UPDATE pool_space SET locked = locked + ?1 WHERE pool_name = ?2",
            params![amount, record.pool_name],
        )
        .map_err(|e| db_err("lock pool ledger", e))?;
        Ok(())
    }

    /// Claims the next reservation token. One transaction per token keeps
    /// tokens unique across restarts and concurrent callers.
    pub fn next_token(&self) -> LeaseResult<SpaceToken> {
        self.with_tx("next token", |tx| {
            let token: i64 = tx
                .query_row("SELECT next_token FROM next_space_token", [], |row| {
                    row.get(0)
                })
                .map_err(|e| db_err("read token counter", e))?;
            tx.execute(
                "UPDATE next_space_token SET next_token = ?1",
                params![token + 1],
            )
            .map_err(|e| db_err("advance token counter", e))?;
            Ok(token)
        })
    }

    /// Records a reservation the pool already granted and grows the pool
    /// ledger by its size.
    pub fn register_reservation(&self, record: &SpaceReservationRecord) -> LeaseResult<()> {
        self.with_tx("register reservation", |tx| {
            tx.execute(
                "INSERT INTO pool_space (pool_name, reserved, locked)
                 SELECT ?1, 0, 0
                 WHERE NOT EXISTS (SELECT 1 FROM pool_space WHERE pool_name = ?1)",
                params![record.pool_name],
            )
            .map_err(|e| db_err("insert pool ledger", e))?;
            tx.execute(
                "UPDATE pool_space
                 SET reserved = reserved + ?1, locked = locked + ?2
                 WHERE pool_name = ?3",
                params![record.reserved, record.locked, record.pool_name],
            )
            .map_err(|e| db_err("grow pool ledger", e))?;
            tx.execute(
                "INSERT INTO space_reservations
                    (space_token, reserved, locked, creation_time, lifetime,
                     pool_name, path, created_entry, utilized)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.token,
                    record.reserved,
                    record.locked,
                    record.creation_time as i64,
                    record.lifetime as i64,
                    record.pool_name,
                    record.path,
                    record.created_entry,
                    record.utilized,
                ],
            )
            .map_err(|e| db_err("insert reservation", e))?;
            Ok(())
        })
    }

    /// Locks everything still available on the reservation. Returns the
    /// pool and the byte count to release on the pool side: the full
    /// reserved size under `force`, otherwise only what was available.
    pub fn lock_all(&self, token: SpaceToken, force: bool) -> LeaseResult<(String, u64)> {
        self.with_tx("lock all", |tx| {
            let record = Self::load_row(tx, token)?;
            let available = record.reserved - record.locked;
            if available > 0 {
                Self::apply_row_lock(tx, &record, available)?;
            }
            let bytes = if force { record.reserved } else { available };
            Ok((record.pool_name, bytes.max(0) as u64))
        })
    }

    /// Locks exactly `size` bytes, failing when the reservation does not
    /// have that much available.
    pub fn lock_exact(&self, token: SpaceToken, size: u64) -> LeaseResult<String> {
        self.with_tx("lock exact", |tx| {
            let record = Self::load_row(tx, token)?;
            let available = record.reserved - record.locked;
            if available < size as i64 {
                return Err(LeaseError::InvalidParam(format!(
                    "reservation {} has {} bytes available, cannot lock {}",
                    token, available, size
                )));
            }
            Self::apply_row_lock(tx, &record, size as i64)?;
            Ok(record.pool_name)
        })
    }

    /// Moves `size` bytes back from locked to available.
    pub fn unlock(&self, token: SpaceToken, size: u64) -> LeaseResult<()> {
        if size == 0 {
            warn!("Unlock of 0 bytes on reservation {}, nothing to do", token);
            return Ok(());
        }
        self.with_tx("unlock", |tx| {
            let record = Self::load_row(tx, token)?;
            if record.locked < size as i64 {
                return Err(LeaseError::Inconsistent(format!(
                    "reservation {} has {} bytes locked, cannot unlock {}",
                    token, record.locked, size
                )));
            }
            let ledger = Self::pool_ledger(tx, &record.pool_name)?;
            if ledger.locked < size as i64 {
                return Err(LeaseError::Inconsistent(format!(
                    "pool {} ledger has {} bytes locked, cannot unlock {}",
                    record.pool_name, ledger.locked, size
                )));
            }
            Self::apply_row_lock(tx, &record, -(size as i64))?;
            Ok(())
        })
    }

    /// Unlocks `unlock` bytes and shrinks the reservation by `decrease`
    /// bytes in one step. A reservation shrunk to nothing is deleted.
    /// Returns true if the row was deleted.
    ///
    /// `expected_pool_reserved`, when given, is compared against the pool
    /// ledger after the decrease; a mismatch is logged but does not fail
    /// the operation, the periodic cleanup pass reconciles it.
    pub fn unlock_and_decrease(
        &self,
        token: SpaceToken,
        unlock: u64,
        decrease: u64,
        expected_pool_reserved: Option<i64>,
        utilized: bool,
    ) -> LeaseResult<bool> {
        if decrease > unlock {
            return Err(LeaseError::InvalidParam(format!(
                "cannot decrease {} bytes while unlocking only {}",
                decrease, unlock
            )));
        }
        self.with_tx("unlock and decrease", |tx| {
            let record = Self::load_row(tx, token)?;
            if record.locked < unlock as i64 {
                return Err(LeaseError::Inconsistent(format!(
                    "reservation {} has {} bytes locked, cannot unlock {}",
                    token, record.locked, unlock
                )));
            }

            let new_reserved = record.reserved - decrease as i64;
            let deleted = if new_reserved <= 0 {
                // Give the whole row back to the ledger, not just the
                // decreased part, so the ledger stays the sum of its rows.
                tx.execute(
                    "UPDATE pool_space
                     SET reserved = reserved - ?1, locked = locked - ?2
                     WHERE pool_name = ?3",
                    params![record.reserved, record.locked, record.pool_name],
                )
                .map_err(|e| db_err("shrink pool ledger", e))?;
                tx.execute(
                    "DELETE FROM space_reservations WHERE space_token = ?1",
                    params![token],
                )
                .map_err(|e| db_err("delete reservation", e))?;
                true
            } else {
                let new_locked = record.locked - unlock as i64;
                if new_locked > new_reserved {
                    return Err(LeaseError::Inconsistent(format!(
                        "reservation {} would end up with locked {} > reserved {}",
                        token, new_locked, new_reserved
                    )));
                }
                tx.execute(
                    "UPDATE space_reservations
                     SET reserved = ?1, locked = ?2, utilized = utilized OR ?3
                     WHERE space_token = ?4",
                    params![new_reserved, new_locked, utilized, token],
                )
                .map_err(|e| db_err("shrink reservation", e))?;
                tx.execute(
                    "UPDATE pool_space
                     SET reserved = reserved - ?1, locked = locked - ?2
                     WHERE pool_name = ?3",
                    params![decrease as i64, unlock as i64, record.pool_name],
                )
                .map_err(|e| db_err("shrink pool ledger", e))?;
                false
            };

            if let Some(expected) = expected_pool_reserved {
                let ledger = Self::pool_ledger(tx, &record.pool_name)?;
                if ledger.reserved != expected {
                    warn!(
                        "Pool {} ledger has {} bytes reserved, pool reports {}",
                        record.pool_name, ledger.reserved, expected
                    );
                }
            }
            Ok(deleted)
        })
    }

    /// Finds the reservation by token or by path and locks whatever is
    /// still available on it, handing the caller exclusive use of those
    /// bytes until they are unlocked or consumed.
    pub fn get_and_lock(
        &self,
        token: Option<SpaceToken>,
        path: Option<&str>,
    ) -> LeaseResult<LockedReservationInfo> {
        self.with_tx("get and lock", |tx| {
            let record = match (token, path) {
                (Some(token), _) => Self::load_row(tx, token)?,
                (None, Some(path)) => tx
                    .query_row(
                        "SELECT space_token, reserved, locked, creation_time, lifetime,
                                pool_name, path, created_entry, utilized
                         FROM space_reservations WHERE path = ?1
                         ORDER BY space_token LIMIT 1",
                        params![path],
                        row_to_record,
                    )
                    .optional()
                    .map_err(|e| db_err("load reservation by path", e))?
                    .ok_or_else(|| {
                        LeaseError::NotFound(format!("no space reservation for path {}", path))
                    })?,
                (None, None) => {
                    return Err(LeaseError::InvalidParam(
                        "either a token or a path is required".to_string(),
                    ))
                }
            };

            let available = record.reserved - record.locked;
            if available <= 0 {
                return Err(LeaseError::InvalidParam(format!(
                    "reservation {} has no available space left",
                    record.token
                )));
            }
            Self::apply_row_lock(tx, &record, available)?;
            Ok(LockedReservationInfo {
                token: record.token,
                pool_name: record.pool_name.clone(),
                locked_now: available as u64,
                creation_time: record.creation_time,
                expiration: record.expiration(),
            })
        })
    }

    pub fn load_all(&self) -> LeaseResult<Vec<SpaceReservationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT space_token, reserved, locked, creation_time, lifetime,
                        pool_name, path, created_entry, utilized
                 FROM space_reservations ORDER BY space_token",
            )
            .map_err(|e| db_err("prepare reservation query", e))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| db_err("query reservations", e))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| db_err("read reservation row", e))?);
        }
        Ok(records)
    }

    fn pool_ledger(tx: &Transaction, pool: &str) -> LeaseResult<PoolLedgerRecord> {
        tx.query_row(
            "SELECT pool_name, reserved, locked FROM pool_space WHERE pool_name = ?1",
            params![pool],
            |row| {
                Ok(PoolLedgerRecord {
                    pool_name: row.get(0)?,
                    reserved: row.get(1)?,
                    locked: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_err("load pool ledger", e))?
        .ok_or_else(|| LeaseError::Inconsistent(format!("no ledger entry for pool {}", pool)))
    }

    pub fn pool_reserved(&self, pool: &str) -> LeaseResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT reserved FROM pool_space WHERE pool_name = ?1",
            params![pool],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| db_err("read pool ledger", e))
    }

    pub fn load_ledger(&self) -> LeaseResult<Vec<PoolLedgerRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT pool_name, reserved, locked FROM pool_space ORDER BY pool_name")
            .map_err(|e| db_err("prepare ledger query", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PoolLedgerRecord {
                    pool_name: row.get(0)?,
                    reserved: row.get(1)?,
                    locked: row.get(2)?,
                })
            })
            .map_err(|e| db_err("query ledger", e))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| db_err("read ledger row", e))?);
        }
        Ok(records)
    }

    /// The pool's replicas are gone, and with them every reservation on it.
    pub fn pool_down(&self, pool: &str) -> LeaseResult<()> {
        self.with_tx("pool down", |tx| {
            let deleted = tx
                .execute(
                    "DELETE FROM space_reservations WHERE pool_name = ?1",
                    params![pool],
                )
                .map_err(|e| db_err("delete pool reservations", e))?;
            tx.execute(
                "UPDATE pool_space SET reserved = 0, locked = 0 WHERE pool_name = ?1",
                params![pool],
            )
            .map_err(|e| db_err("zero pool ledger", e))?;
            info!("Pool {} went down, dropped {} reservations", pool, deleted);
            Ok(())
        })
    }

    /// Deletes reservations that are `grace_ms` past their expiration and
    /// recomputes every pool ledger from the surviving rows. Returns the
    /// recomputed reserved total per pool so the caller can push it out.
    pub fn cleanup(&self, now: u64, grace_ms: u64) -> LeaseResult<Vec<(String, i64)>> {
        self.with_tx("cleanup", |tx| {
            let deleted = tx
                .execute(
                    "DELETE FROM space_reservations
                     WHERE creation_time + lifetime + ?1 < ?2",
                    params![grace_ms as i64, now as i64],
                )
                .map_err(|e| db_err("delete stale reservations", e))?;
            if deleted > 0 {
                info!("Cleanup removed {} stale space reservations", deleted);
            }

            tx.execute(
                "UPDATE pool_space SET
                    reserved = COALESCE((SELECT SUM(reserved) FROM space_reservations
                                         WHERE pool_name = pool_space.pool_name), 0),
                    locked = COALESCE((SELECT SUM(locked) FROM space_reservations
                                       WHERE pool_name = pool_space.pool_name), 0)",
                [],
            )
            .map_err(|e| db_err("recompute ledger", e))?;

            let mut stmt = tx
                .prepare("SELECT pool_name, reserved FROM pool_space ORDER BY pool_name")
                .map_err(|e| db_err("prepare ledger query", e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| db_err("query ledger", e))?;
            let mut totals = Vec::new();
            for row in rows {
                totals.push(row.map_err(|e| db_err("read ledger row", e))?);
            }
            Ok(totals)
        })
    }

    pub fn list(&self, long: bool) -> LeaseResult<String> {
        let records = self.load_all()?;
        if records.is_empty() && !long {
            return Ok("no space reservations".to_string());
        }
        let mut out = String::new();
        for record in &records {
            let _ = writeln!(
                out,
                "token {} pool {} reserved {} locked {} expires at {}{}{}",
                record.token,
                record.pool_name,
                record.reserved,
                record.locked,
                crate::format_millis(record.expiration()),
                if record.utilized { " utilized" } else { "" },
                if record.created_entry {
                    " created-entry"
                } else {
                    ""
                },
            );
            if long {
                let _ = writeln!(out, "  path {}", record.path);
            }
        }
        if long {
            let _ = writeln!(out, "per-pool totals:");
            for ledger in self.load_ledger()? {
                let _ = writeln!(
                    out,
                    "  pool {} reserved {} locked {}",
                    ledger.pool_name, ledger.reserved, ledger.locked
                );
            }
        }
        if out.is_empty() {
            out = "no space reservations".to_string();
        }
        Ok(out)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpaceReservationRecord> {
    Ok(SpaceReservationRecord {
        token: row.get(0)?,
        reserved: row.get(1)?,
        locked: row.get(2)?,
        creation_time: row.get::<_, i64>(3)? as u64,
        lifetime: row.get::<_, i64>(4)? as u64,
        pool_name: row.get(5)?,
        path: row.get(6)?,
        created_entry: row.get(7)?,
        utilized: row.get(8)?,
    })
}
