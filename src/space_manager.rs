use crate::collaborator::{with_timeout, NamespaceClient, PoolClient};
use crate::expiry::ExpiryScheduler;
use crate::reserve_companion::{ReserveSpaceCompanion, ReserveTarget};
use crate::space_db::{LockedReservationInfo, SpaceDb};
use crate::{
    normalize_path, unix_millis, FileId, LeaseError, LeaseResult, PoolStatus,
    SpaceReservationRecord, SpaceToken, StorageInfo,
};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceManagerConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_cleanup_period_secs")]
    pub cleanup_period_secs: u64,
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_cleanup_period_secs() -> u64 {
    3600
}

// Expired reservations linger this long before the cleanup pass deletes
// them, leaving room for a late release to go through the normal path.
fn default_cleanup_grace_ms() -> u64 {
    600_000
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

impl SpaceManagerConfig {
    pub fn load(path: &std::path::Path) -> LeaseResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            warn!("Failed to read space config {:?}: {}", path, e);
            LeaseError::Internal(e.to_string())
        })?;
        serde_json::from_str(&data).map_err(|e| {
            warn!("Failed to parse space config {:?}: {}", path, e);
            LeaseError::InvalidParam(e.to_string())
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub path: String,
    pub size: u64,
    pub lifetime_ms: u64,
    pub client_host: String,
    pub owner: Option<(u32, u32)>,
    pub known: Option<(FileId, StorageInfo)>,
}

/// Tracks space reservations on pools: grants them through the reserve
/// workflow, accounts for them in the db, expires them on timers and heals
/// drift with a periodic cleanup pass.
pub struct SpaceManager {
    db: Arc<SpaceDb>,
    timers: Arc<ExpiryScheduler<SpaceToken>>,
    namespace: Arc<dyn NamespaceClient>,
    pools: Arc<dyn PoolClient>,
    cleanup_period_secs: u64,
    cleanup_grace_ms: u64,
    call_timeout_ms: u64,
    cleanup_worker: Mutex<Option<JoinHandle<()>>>,
    // One gate per token; a release holds it from the lock step through
    // the accounting decrease, so an expiry timer racing an explicit
    // release waits and then finds the row gone instead of freeing the
    // same bytes on the pool twice.
    release_gates: Mutex<HashMap<SpaceToken, Arc<tokio::sync::Mutex<()>>>>,
}

impl SpaceManager {
    pub fn new(
        config: SpaceManagerConfig,
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
    ) -> LeaseResult<Arc<Self>> {
        let db = Arc::new(SpaceDb::new(&config.db_path)?);
        Ok(Arc::new(SpaceManager {
            db,
            timers: ExpiryScheduler::new(),
            namespace,
            pools,
            cleanup_period_secs: config.cleanup_period_secs,
            cleanup_grace_ms: config.cleanup_grace_ms,
            call_timeout_ms: config.call_timeout_ms,
            cleanup_worker: Mutex::new(None),
            release_gates: Mutex::new(HashMap::new()),
        }))
    }

    /// Reserves `size` bytes for a file and returns the token the space is
    /// addressed by from now on.
    pub async fn reserve_space(self: &Arc<Self>, request: ReserveRequest) -> LeaseResult<SpaceToken> {
        if request.size == 0 {
            return Err(LeaseError::InvalidParam(
                "reservation size must be positive".to_string(),
            ));
        }
        if request.lifetime_ms == 0 {
            return Err(LeaseError::InvalidParam(
                "reservation lifetime must be positive".to_string(),
            ));
        }
        if request.path.is_empty() {
            return Err(LeaseError::InvalidParam(
                "reservation path must not be empty".to_string(),
            ));
        }
        let path = normalize_path(&request.path);

        // Claim the token before anything is granted on the pool: a
        // counter failure then costs nothing, while a failure after the
        // grant would strand pool-side space. The counter write also
        // stays outside the registration transaction this way.
        let token = self.db.next_token()?;

        let companion =
            ReserveSpaceCompanion::new(self.namespace.clone(), self.pools.clone(), self.call_timeout_ms);
        let outcome = companion
            .run(ReserveTarget {
                path: path.clone(),
                size: request.size,
                client_host: request.client_host.clone(),
                owner: request.owner,
                known: request.known.clone(),
            })
            .await?;

        let record = SpaceReservationRecord {
            token,
            reserved: request.size as i64,
            locked: 0,
            creation_time: unix_millis(),
            lifetime: request.lifetime_ms,
            pool_name: outcome.pool.clone(),
            path,
            created_entry: outcome.created_entry,
            utilized: false,
        };
        if let Err(e) = self.db.register_reservation(&record) {
            // The pool already granted the space, give it back.
            error!(
                "Failed to register reservation {} on pool {}: {}",
                token, outcome.pool, e
            );
            let pools = self.pools.clone();
            let pool = outcome.pool.clone();
            let size = request.size;
            tokio::spawn(async move {
                if let Err(e) = pools.release_space(&pool, size).await {
                    warn!("Failed to give back {} bytes on pool {}: {}", size, pool, e);
                }
            });
            return Err(e);
        }

        // The pool reported its reserved total with the grant; a ledger
        // that disagrees is worth a warning, the cleanup pass reconciles.
        if let Ok(Some(ledger_total)) = self.db.pool_reserved(&outcome.pool) {
            if ledger_total != outcome.pool_reserved_total as i64 {
                warn!(
                    "Pool {} reports {} bytes reserved, ledger has {}",
                    outcome.pool, outcome.pool_reserved_total, ledger_total
                );
            }
        }

        self.schedule_expiry(token, Duration::from_millis(request.lifetime_ms));
        Ok(token)
    }

    fn schedule_expiry(self: &Arc<Self>, token: SpaceToken, delay: Duration) {
        let this = self.clone();
        self.timers.schedule(token, delay, async move {
            debug!("Space reservation {} expired", token);
            if let Err(e) = this.release_space(token, None, true).await {
                warn!("Failed to release expired reservation {}: {}", token, e);
            }
        });
    }

    /// Releases reserved space back to the pool. Without a size the whole
    /// still-available part is released (everything including locked bytes
    /// under `force`); with a size, exactly that much. Releasing a token
    /// that no longer exists is not an error, releases are racy with
    /// expiry by nature.
    pub async fn release_space(
        self: &Arc<Self>,
        token: SpaceToken,
        size: Option<u64>,
        force: bool,
    ) -> LeaseResult<()> {
        let gate = self
            .release_gates
            .lock()
            .unwrap()
            .entry(token)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _held = gate.lock().await;
            self.release_space_locked(token, size, force).await
        };
        let mut gates = self.release_gates.lock().unwrap();
        if let Some(entry) = gates.get(&token) {
            // Only the map and our clone left, nobody is waiting.
            if Arc::strong_count(entry) <= 2 {
                gates.remove(&token);
            }
        }
        result
    }

    async fn release_space_locked(
        self: &Arc<Self>,
        token: SpaceToken,
        size: Option<u64>,
        force: bool,
    ) -> LeaseResult<()> {
        let (pool, bytes) = match size {
            Some(0) => {
                return Err(LeaseError::InvalidParam(
                    "release size must be positive".to_string(),
                ))
            }
            Some(size) => (self.db.lock_exact(token, size)?, size),
            None => match self.db.lock_all(token, force) {
                Ok(locked) => locked,
                Err(LeaseError::NotFound(_)) => {
                    info!("Reservation {} already gone, release is a no-op", token);
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        let mut pool_reserved = None;
        if bytes > 0 {
            match with_timeout(
                self.call_timeout_ms,
                "release_space",
                self.pools.release_space(&pool, bytes),
            )
            .await
            {
                Ok(remaining) => pool_reserved = Some(remaining as i64),
                Err(e) => {
                    // The pool kept the space, so must the accounting.
                    if let Err(unlock_err) = self.db.unlock(token, bytes) {
                        warn!(
                            "Failed to unlock {} bytes on reservation {} after pool error: {}",
                            bytes, token, unlock_err
                        );
                    }
                    return Err(e);
                }
            }
        }

        let deleted = self
            .db
            .unlock_and_decrease(token, bytes, bytes, pool_reserved, false)?;
        if deleted || size.is_none() {
            self.timers.cancel(&token);
        }
        Ok(())
    }

    /// Moves `size` locked bytes back to available without touching the
    /// pool.
    pub fn unlock_space(&self, token: SpaceToken, size: u64) -> LeaseResult<()> {
        self.db.unlock(token, size)
    }

    /// Consumes `size` locked bytes: the data was written, the space is no
    /// longer merely reserved. Returns true when the reservation is used up
    /// and gone.
    pub fn mark_utilized(&self, token: SpaceToken, size: u64) -> LeaseResult<bool> {
        let deleted = self.db.unlock_and_decrease(token, size, size, None, true)?;
        if deleted {
            self.timers.cancel(&token);
        }
        Ok(deleted)
    }

    /// Looks a reservation up by token or path and locks its available
    /// remainder for the caller.
    pub fn lock_and_get_reservation(
        &self,
        token: Option<SpaceToken>,
        path: Option<&str>,
    ) -> LeaseResult<LockedReservationInfo> {
        let normalized = path.map(normalize_path);
        self.db.get_and_lock(token, normalized.as_deref())
    }

    pub fn pool_status_changed(self: &Arc<Self>, pool: &str, status: PoolStatus) -> LeaseResult<()> {
        match status {
            PoolStatus::Down => self.db.pool_down(pool),
            PoolStatus::Up | PoolStatus::Restart => {
                // A pool that (re)appeared lost its in-memory reservation
                // total, push ours.
                if let Some(total) = self.db.pool_reserved(pool)? {
                    let pools = self.pools.clone();
                    let pool = pool.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = pools.sync_reserved(&pool, total.max(0) as u64).await {
                            warn!("Failed to sync reserved total to pool {}: {}", pool, e);
                        }
                    });
                }
                Ok(())
            }
        }
    }

    /// One self-healing pass: drop reservations long past their expiry,
    /// recompute every pool ledger from the surviving rows and push the
    /// totals out.
    pub async fn run_cleanup(self: &Arc<Self>) -> LeaseResult<()> {
        let totals = self.db.cleanup(unix_millis(), self.cleanup_grace_ms)?;
        for (pool, reserved) in totals {
            let result = with_timeout(
                self.call_timeout_ms,
                "sync_reserved",
                self.pools.sync_reserved(&pool, reserved.max(0) as u64),
            )
            .await;
            if let Err(e) = result {
                warn!("Failed to sync reserved total to pool {}: {}", pool, e);
            }
        }
        Ok(())
    }

    pub fn spawn_cleanup_worker(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(this.cleanup_period_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_cleanup().await {
                    warn!("Space cleanup pass failed: {}", e);
                }
            }
        });
        let mut worker = self.cleanup_worker.lock().unwrap();
        if let Some(old) = worker.replace(handle) {
            old.abort();
        }
    }

    /// Rearms expiry timers from the db after a restart. Reservations found
    /// already expired are released right away.
    pub fn restore_timers(self: &Arc<Self>) -> LeaseResult<()> {
        let records = self.db.load_all()?;
        let now = unix_millis();
        info!("Restoring timers for {} space reservations", records.len());
        for record in records {
            let expiration = record.expiration();
            let delay = if expiration <= now {
                Duration::ZERO
            } else {
                Duration::from_millis(expiration - now)
            };
            self.schedule_expiry(record.token, delay);
        }
        Ok(())
    }

    pub fn list_reservations(&self, long: bool) -> LeaseResult<String> {
        self.db.list(long)
    }

    pub fn shutdown(&self) {
        self.timers.shutdown();
        if let Some(handle) = self.cleanup_worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}
