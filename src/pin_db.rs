use crate::{FileId, LeaseError, LeaseResult, PinRequestId, PinRequestRecord};
use log::*;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

/// Durable store for pin request rows and the pin id counter.
pub struct PinDb {
    conn: Mutex<Connection>,
}

impl PinDb {
    pub fn new(db_path: &Path) -> LeaseResult<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            error!("Failed to open pin db at {:?}: {}", db_path, e);
            LeaseError::DbError(e.to_string())
        })?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pin_requests (
                pin_request_id INTEGER PRIMARY KEY,
                file_id TEXT NOT NULL,
                expiration INTEGER NOT NULL,
                client_request_id INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_pin_requests_file_id
                ON pin_requests (file_id);
            CREATE TABLE IF NOT EXISTS next_pin_request_id (
                next_id INTEGER NOT NULL
            );",
        )
        .map_err(|e| {
            error!("Failed to create pin tables: {}", e);
            LeaseError::DbError(e.to_string())
        })?;

        // Seed the counter row exactly once.
        conn.execute(
            "INSERT INTO next_pin_request_id (next_id)
             SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM next_pin_request_id)",
            [],
        )
        .map_err(|e| {
            error!("Failed to seed pin id counter: {}", e);
            LeaseError::DbError(e.to_string())
        })?;

        Ok(PinDb {
            conn: Mutex::new(conn),
        })
    }

    /// Claims `step` consecutive ids and returns the first of the range.
    /// The advance happens under a write transaction so concurrent claimants
    /// never overlap.
    pub fn next_batch(&self, step: i64) -> LeaseResult<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                warn!("Failed to start id batch transaction: {}", e);
                LeaseError::DbError(e.to_string())
            })?;

        let base: i64 = tx
            .query_row("SELECT next_id FROM next_pin_request_id", [], |row| {
                row.get(0)
            })
            .map_err(|e| {
                warn!("Failed to read pin id counter: {}", e);
                LeaseError::DbError(e.to_string())
            })?;

        tx.execute(
            "UPDATE next_pin_request_id SET next_id = ?1",
            params![base + step],
        )
        .map_err(|e| {
            warn!("Failed to advance pin id counter: {}", e);
            LeaseError::DbError(e.to_string())
        })?;

        tx.commit().map_err(|e| {
            warn!("Failed to commit id batch: {}", e);
            LeaseError::DbError(e.to_string())
        })?;

        Ok(base)
    }

    pub fn insert(&self, record: &PinRequestRecord) -> LeaseResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO pin_requests
                (pin_request_id, file_id, expiration, client_request_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.pin_request_id,
                record.file_id.as_str(),
                record.expiration as i64,
                record.client_request_id,
            ],
        )
        .map_err(|e| {
            warn!(
                "Failed to insert pin request {}: {}",
                record.pin_request_id, e
            );
            LeaseError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn update_expiration(&self, id: PinRequestId, expiration: u64) -> LeaseResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE pin_requests SET expiration = ?1 WHERE pin_request_id = ?2",
                params![expiration as i64, id],
            )
            .map_err(|e| {
                warn!("Failed to update pin request {}: {}", id, e);
                LeaseError::DbError(e.to_string())
            })?;
        if changed == 0 {
            warn!("Pin request {} not in db, expiration update skipped", id);
        }
        Ok(())
    }

    pub fn delete(&self, id: PinRequestId) -> LeaseResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM pin_requests WHERE pin_request_id = ?1",
            params![id],
        )
        .map_err(|e| {
            warn!("Failed to delete pin request {}: {}", id, e);
            LeaseError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn load_all(&self) -> LeaseResult<Vec<PinRequestRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT pin_request_id, file_id, expiration, client_request_id
                 FROM pin_requests ORDER BY pin_request_id",
            )
            .map_err(|e| {
                warn!("Failed to prepare pin request query: {}", e);
                LeaseError::DbError(e.to_string())
            })?;

        let rows = stmt
            .query_map([], |row| {
                Ok(PinRequestRecord {
                    pin_request_id: row.get(0)?,
                    file_id: FileId::new(row.get::<_, String>(1)?),
                    expiration: row.get::<_, i64>(2)? as u64,
                    client_request_id: row.get(3)?,
                })
            })
            .map_err(|e| {
                warn!("Failed to query pin requests: {}", e);
                LeaseError::DbError(e.to_string())
            })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| {
                warn!("Failed to read pin request row: {}", e);
                LeaseError::DbError(e.to_string())
            })?);
        }
        Ok(records)
    }
}
