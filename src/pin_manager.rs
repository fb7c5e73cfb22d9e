use crate::collaborator::{NamespaceClient, PoolClient};
use crate::expiry::ExpiryScheduler;
use crate::pin_db::PinDb;
use crate::pinner::{Pinner, Unpinner};
use crate::write_behind::{PinWriteOp, WriteBehindQueue};
use crate::{
    unix_millis, FileId, LeaseError, LeaseResult, PinRequestId, PinRequestRecord, PinState,
    StorageInfo,
};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

// Ids are claimed from the counter table in ranges of this size, so the
// common path never touches the db.
const ID_BATCH_STEP: i64 = 1000;

// Rows found expired at startup get this much fresh lifetime instead of
// firing their timers immediately.
const RECOVERY_GRACE_MS: u64 = 60_000;

const MAX_UNPIN_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinManagerConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_max_pin_duration_ms")]
    pub max_pin_duration_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_owner_tag")]
    pub owner_tag: String,
}

fn default_max_pin_duration_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_owner_tag() -> String {
    "PinManager".to_string()
}

impl PinManagerConfig {
    pub fn load(path: &std::path::Path) -> LeaseResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            warn!("Failed to read pin config {:?}: {}", path, e);
            LeaseError::Internal(e.to_string())
        })?;
        serde_json::from_str(&data).map_err(|e| {
            warn!("Failed to parse pin config {:?}: {}", path, e);
            LeaseError::InvalidParam(e.to_string())
        })
    }
}

struct Waiter {
    pin_request_id: PinRequestId,
    tx: oneshot::Sender<LeaseResult<()>>,
}

/// Per-file aggregate: current state, the leases holding the file, and the
/// waiters blocked on the in-flight transition. At most one handler task is
/// active per aggregate.
struct Pin {
    state: PinState,
    storage_info: Option<StorageInfo>,
    requests: HashMap<PinRequestId, PinRequestRecord>,
    waiters: Vec<Waiter>,
    unpin_retries: u32,
}

impl Pin {
    fn new() -> Self {
        Pin {
            state: PinState::Initial,
            storage_info: None,
            requests: HashMap::new(),
            waiters: Vec::new(),
            unpin_retries: 0,
        }
    }
}

struct IdAlloc {
    next: i64,
    remaining: i64,
}

/// Keeps files on disk as long as at least one lease on them is alive.
/// The in-memory index is authoritative; the db rows exist for recovery.
pub struct PinManager {
    index: Mutex<HashMap<FileId, Pin>>,
    db: Arc<PinDb>,
    queue: WriteBehindQueue,
    timers: Arc<ExpiryScheduler<PinRequestId>>,
    namespace: Arc<dyn NamespaceClient>,
    pools: Arc<dyn PoolClient>,
    id_alloc: Mutex<IdAlloc>,
    max_pin_duration_ms: AtomicU64,
    call_timeout_ms: u64,
    owner_tag: String,
}

impl PinManager {
    pub fn new(
        config: PinManagerConfig,
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
    ) -> LeaseResult<Arc<Self>> {
        let db = Arc::new(PinDb::new(&config.db_path)?);
        let queue = WriteBehindQueue::spawn(db.clone());

        Ok(Arc::new(PinManager {
            index: Mutex::new(HashMap::new()),
            db,
            queue,
            timers: ExpiryScheduler::new(),
            namespace,
            pools,
            id_alloc: Mutex::new(IdAlloc {
                next: 0,
                remaining: 0,
            }),
            max_pin_duration_ms: AtomicU64::new(config.max_pin_duration_ms),
            call_timeout_ms: config.call_timeout_ms,
            owner_tag: config.owner_tag,
        }))
    }

    fn next_pin_request_id(&self) -> LeaseResult<PinRequestId> {
        let mut alloc = self.id_alloc.lock().unwrap();
        if alloc.remaining == 0 {
            alloc.next = self.db.next_batch(ID_BATCH_STEP)?;
            alloc.remaining = ID_BATCH_STEP;
        }
        let id = alloc.next;
        alloc.next += 1;
        alloc.remaining -= 1;
        Ok(id)
    }

    fn clamp_lifetime(&self, lifetime_ms: u64) -> u64 {
        let max = self.max_pin_duration_ms.load(Ordering::Relaxed);
        if lifetime_ms > max {
            info!("Requested pin lifetime {}ms clamped to {}ms", lifetime_ms, max);
            max
        } else {
            lifetime_ms
        }
    }

    /// Pins a file and waits until the file is actually pinned (or the
    /// attempt fails). Returns the lease id usable with `unpin` and
    /// `extend_lifetime`.
    pub async fn pin(
        self: &Arc<Self>,
        file_id: FileId,
        lifetime_ms: u64,
        client_request_id: i64,
    ) -> LeaseResult<PinRequestId> {
        let (id, rx) = self.submit_pin(file_id, lifetime_ms, client_request_id, true)?;
        match rx {
            Some(rx) => match rx.await {
                Ok(Ok(())) => Ok(id),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(LeaseError::Internal(
                    "pin waiter dropped without a reply".to_string(),
                )),
            },
            None => Ok(id),
        }
    }

    /// Pins a file without waiting for the protocol to finish. The lease is
    /// registered immediately; progress is observable via `pin_state`.
    pub fn pin_detached(
        self: &Arc<Self>,
        file_id: FileId,
        lifetime_ms: u64,
        client_request_id: i64,
    ) -> LeaseResult<PinRequestId> {
        let (id, _) = self.submit_pin(file_id, lifetime_ms, client_request_id, false)?;
        Ok(id)
    }

    fn submit_pin(
        self: &Arc<Self>,
        file_id: FileId,
        lifetime_ms: u64,
        client_request_id: i64,
        wait: bool,
    ) -> LeaseResult<(PinRequestId, Option<oneshot::Receiver<LeaseResult<()>>>)> {
        if lifetime_ms == 0 {
            return Err(LeaseError::InvalidParam(
                "pin lifetime must be positive".to_string(),
            ));
        }
        let lifetime_ms = self.clamp_lifetime(lifetime_ms);

        // Claim the id before taking the index lock, the claim may hit
        // the counter table.
        let id = self.next_pin_request_id()?;
        let expiration = unix_millis() + lifetime_ms;
        let record = PinRequestRecord {
            pin_request_id: id,
            file_id: file_id.clone(),
            expiration,
            client_request_id,
        };

        let mut rx = None;
        {
            let mut index = self.index.lock().unwrap();
            let pin = index.entry(file_id.clone()).or_insert_with(Pin::new);
            pin.requests.insert(id, record.clone());
            self.queue.enqueue(PinWriteOp::Insert(record));

            match pin.state {
                PinState::Initial => {
                    pin.state = PinState::Pinning;
                    if wait {
                        let (tx, waiter_rx) = oneshot::channel();
                        pin.waiters.push(Waiter {
                            pin_request_id: id,
                            tx,
                        });
                        rx = Some(waiter_rx);
                    }
                    self.spawn_pinner(file_id.clone(), pin.storage_info.clone());
                }
                PinState::Pinning | PinState::Unpinning => {
                    // The running handler's completion callback picks the
                    // new lease up.
                    if wait {
                        let (tx, waiter_rx) = oneshot::channel();
                        pin.waiters.push(Waiter {
                            pin_request_id: id,
                            tx,
                        });
                        rx = Some(waiter_rx);
                    }
                }
                PinState::Pinned => {
                    debug!("{} already pinned, lease {} joins", file_id, id);
                }
            }
        }

        self.schedule_expiry(id, file_id, lifetime_ms);
        Ok((id, rx))
    }

    fn schedule_expiry(self: &Arc<Self>, id: PinRequestId, file_id: FileId, delay_ms: u64) {
        let this = self.clone();
        self.timers
            .schedule(id, Duration::from_millis(delay_ms), async move {
                debug!("Pin lease {} for {} expired", id, file_id);
                match this.unpin(&file_id, id) {
                    Ok(()) | Err(LeaseError::NotFound(_)) => {}
                    Err(e) => warn!("Failed to release expired lease {}: {}", id, e),
                }
            });
    }

    fn spawn_pinner(self: &Arc<Self>, file_id: FileId, storage_info: Option<StorageInfo>) {
        let pinner = Pinner::new(
            self.namespace.clone(),
            self.pools.clone(),
            file_id.clone(),
            storage_info,
            self.owner_tag.clone(),
            self.call_timeout_ms,
        );
        let this = self.clone();
        tokio::spawn(async move {
            match pinner.run().await {
                Ok(storage_info) => this.pin_succeeded(&file_id, storage_info),
                Err(e) => this.pin_failed(&file_id, e),
            }
        });
    }

    fn spawn_unpinner(self: &Arc<Self>, file_id: FileId) {
        let unpinner = Unpinner::new(
            self.namespace.clone(),
            self.pools.clone(),
            file_id.clone(),
            self.owner_tag.clone(),
            self.call_timeout_ms,
        );
        let this = self.clone();
        tokio::spawn(async move {
            match unpinner.run().await {
                Ok(()) => this.unpin_succeeded(&file_id),
                Err(e) => this.unpin_failed(&file_id, e),
            }
        });
    }

    /// Releases one lease. When the last lease on a file goes away the file
    /// is unpinned for real.
    pub fn unpin(self: &Arc<Self>, file_id: &FileId, id: PinRequestId) -> LeaseResult<()> {
        let mut index = self.index.lock().unwrap();
        let pin = index
            .get_mut(file_id)
            .ok_or_else(|| LeaseError::NotFound(format!("{} is not pinned", file_id)))?;
        if pin.requests.remove(&id).is_none() {
            return Err(LeaseError::NotFound(format!(
                "no pin lease {} on {}",
                id, file_id
            )));
        }

        self.queue.enqueue(PinWriteOp::Delete { id });
        self.timers.cancel(&id);

        // A waiter whose lease was withdrawn mid-flight gets told so.
        let mut kept = Vec::new();
        for waiter in pin.waiters.drain(..) {
            if waiter.pin_request_id == id {
                let _ = waiter.tx.send(Err(LeaseError::NotFound(
                    "pin lease was released before the pin completed".to_string(),
                )));
            } else {
                kept.push(waiter);
            }
        }
        pin.waiters = kept;

        if !pin.requests.is_empty() {
            return Ok(());
        }

        match pin.state {
            PinState::Pinned => {
                pin.state = PinState::Unpinning;
                self.spawn_unpinner(file_id.clone());
            }
            PinState::Pinning | PinState::Unpinning => {
                // Handler in flight, its completion callback sees the
                // empty lease set and finishes the job.
            }
            PinState::Initial => {
                index.remove(file_id);
            }
        }
        Ok(())
    }

    /// Extends a lease so that it lives for at least `lifetime_ms` more.
    /// A lease already good for longer is left untouched.
    pub fn extend_lifetime(
        self: &Arc<Self>,
        file_id: &FileId,
        id: PinRequestId,
        lifetime_ms: u64,
    ) -> LeaseResult<()> {
        if lifetime_ms == 0 {
            return Err(LeaseError::InvalidParam(
                "pin lifetime must be positive".to_string(),
            ));
        }
        let lifetime_ms = self.clamp_lifetime(lifetime_ms);
        let new_expiration = unix_millis() + lifetime_ms;

        {
            let mut index = self.index.lock().unwrap();
            let pin = index
                .get_mut(file_id)
                .ok_or_else(|| LeaseError::NotFound(format!("{} is not pinned", file_id)))?;
            let record = pin.requests.get_mut(&id).ok_or_else(|| {
                LeaseError::NotFound(format!("no pin lease {} on {}", id, file_id))
            })?;
            if record.expiration >= new_expiration {
                debug!("Lease {} already expires later, extend is a no-op", id);
                return Ok(());
            }
            record.expiration = new_expiration;
            self.queue.enqueue(PinWriteOp::UpdateExpiration {
                id,
                expiration: new_expiration,
            });
        }

        self.schedule_expiry(id, file_id.clone(), lifetime_ms);
        Ok(())
    }

    fn pin_succeeded(self: &Arc<Self>, file_id: &FileId, storage_info: StorageInfo) {
        let mut index = self.index.lock().unwrap();
        let pin = match index.get_mut(file_id) {
            Some(pin) => pin,
            None => {
                warn!("Pin finished for {} but the aggregate is gone", file_id);
                return;
            }
        };

        pin.state = PinState::Pinned;
        pin.storage_info = Some(storage_info);
        pin.unpin_retries = 0;
        for waiter in pin.waiters.drain(..) {
            let _ = waiter.tx.send(Ok(()));
        }

        if pin.requests.is_empty() {
            // Every lease went away while we were pinning.
            pin.state = PinState::Unpinning;
            self.spawn_unpinner(file_id.clone());
        }
    }

    fn pin_failed(self: &Arc<Self>, file_id: &FileId, error: LeaseError) {
        warn!("Pinning {} failed: {}", file_id, error);
        let mut index = self.index.lock().unwrap();
        let pin = match index.remove(file_id) {
            Some(pin) => pin,
            None => return,
        };
        for (id, _) in pin.requests {
            self.queue.enqueue(PinWriteOp::Delete { id });
            self.timers.cancel(&id);
        }
        for waiter in pin.waiters {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }

    fn unpin_succeeded(self: &Arc<Self>, file_id: &FileId) {
        let mut index = self.index.lock().unwrap();
        let pin = match index.get_mut(file_id) {
            Some(pin) => pin,
            None => return,
        };
        if pin.requests.is_empty() {
            index.remove(file_id);
        } else {
            // New leases arrived while we were unpinning, pin again.
            pin.state = PinState::Pinning;
            let storage_info = pin.storage_info.clone();
            self.spawn_pinner(file_id.clone(), storage_info);
        }
    }

    fn unpin_failed(self: &Arc<Self>, file_id: &FileId, error: LeaseError) {
        warn!("Unpinning {} failed: {}", file_id, error);
        let mut index = self.index.lock().unwrap();
        let pin = match index.get_mut(file_id) {
            Some(pin) => pin,
            None => return,
        };
        if pin.requests.is_empty() {
            // Nothing left to serve. The sticky mark may survive on the
            // pool until the next sweep, accounting stays correct.
            index.remove(file_id);
            return;
        }

        pin.unpin_retries += 1;
        if pin.unpin_retries > MAX_UNPIN_RETRIES {
            error!(
                "Giving up on {} after {} failed unpin attempts",
                file_id, pin.unpin_retries
            );
            let pin = index.remove(file_id).unwrap_or_else(Pin::new);
            for (id, _) in pin.requests {
                self.queue.enqueue(PinWriteOp::Delete { id });
                self.timers.cancel(&id);
            }
            for waiter in pin.waiters {
                let _ = waiter.tx.send(Err(error.clone()));
            }
            return;
        }

        pin.state = PinState::Pinning;
        let storage_info = pin.storage_info.clone();
        self.spawn_pinner(file_id.clone(), storage_info);
    }

    /// Rebuilds the in-memory index from the db after a restart. Leases
    /// found already expired get a short fresh lifetime so their release
    /// goes through the normal unpin path once the system is up.
    pub fn recover(self: &Arc<Self>) -> LeaseResult<()> {
        let records = self.db.load_all()?;
        let now = unix_millis();
        info!("Recovering {} pin leases", records.len());

        let mut timers = Vec::new();
        {
            let mut index = self.index.lock().unwrap();
            for mut record in records {
                if record.expiration <= now {
                    record.expiration = now + RECOVERY_GRACE_MS;
                    self.queue.enqueue(PinWriteOp::UpdateExpiration {
                        id: record.pin_request_id,
                        expiration: record.expiration,
                    });
                }
                let pin = index
                    .entry(record.file_id.clone())
                    .or_insert_with(Pin::new);
                pin.state = PinState::Pinned;
                timers.push((
                    record.pin_request_id,
                    record.file_id.clone(),
                    record.expiration - now,
                ));
                pin.requests.insert(record.pin_request_id, record);
            }
        }

        for (id, file_id, delay_ms) in timers {
            self.schedule_expiry(id, file_id, delay_ms);
        }
        Ok(())
    }

    pub fn pin_state(&self, file_id: &FileId) -> Option<PinState> {
        self.index.lock().unwrap().get(file_id).map(|pin| pin.state)
    }

    pub fn list_pins(&self) -> String {
        let index = self.index.lock().unwrap();
        if index.is_empty() {
            return "no files are pinned".to_string();
        }
        let mut out = String::new();
        let mut entries: Vec<_> = index.iter().collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        for (file_id, pin) in entries {
            let _ = writeln!(
                out,
                "{} {} leases={}",
                file_id,
                pin.state,
                pin.requests.len()
            );
            let mut requests: Vec<_> = pin.requests.values().collect();
            requests.sort_by_key(|r| r.pin_request_id);
            for record in requests {
                let _ = writeln!(
                    out,
                    "  lease {} expires at {} (client {})",
                    record.pin_request_id,
                    crate::format_millis(record.expiration),
                    record.client_request_id
                );
            }
        }
        out
    }

    pub fn set_max_pin_duration(&self, max_ms: u64) -> LeaseResult<()> {
        if max_ms == 0 {
            return Err(LeaseError::InvalidParam(
                "max pin duration must be positive".to_string(),
            ));
        }
        self.max_pin_duration_ms.store(max_ms, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_max_pin_duration(&self) -> u64 {
        self.max_pin_duration_ms.load(Ordering::Relaxed)
    }

    /// Waits for every queued bookkeeping write to reach the db.
    pub async fn flush_bookkeeping(&self) {
        self.queue.flush().await;
    }

    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}
