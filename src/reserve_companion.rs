use crate::collaborator::{with_timeout, NamespaceClient, PoolClient};
use crate::{parent_path, FileId, LeaseError, LeaseResult, PathOrId, ProtocolHint, StorageInfo};
use log::*;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveState {
    NotWaiting,
    WaitingStorageInfo,
    WaitingParentStorageInfo,
    WaitingCreateEntryReply,
    WaitingPoolManagerResponse,
    WaitingPoolResponse,
    WaitingDeleteEntryResponse,
    FinalSuccess,
    FinalFailed,
}

impl fmt::Display for ReserveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What the companion hands back once a pool granted the space.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub pool: String,
    /// The pool's total reserved bytes after the grant.
    pub pool_reserved_total: u64,
    /// True if a speculative namespace entry was created (and removed
    /// again) to drive pool selection for a not-yet-existing file.
    pub created_entry: bool,
}

/// Input to a space reservation attempt.
#[derive(Debug, Clone)]
pub struct ReserveTarget {
    /// Normalized namespace path of the file the space is for.
    pub path: String,
    pub size: u64,
    pub client_host: String,
    /// Owner to create a speculative entry as, when the path does not
    /// exist yet. Without it a missing path fails the reservation.
    pub owner: Option<(u32, u32)>,
    /// Skips the namespace lookup when the caller already resolved the
    /// file.
    pub known: Option<(FileId, StorageInfo)>,
}

/// Forward-only workflow that turns a path plus a size into a pool-side
/// space grant: resolve the file (falling back to the parent directory and
/// a speculative entry when it does not exist), select a write pool,
/// reserve the space on it. A speculative entry is removed again before
/// reporting success, and best-effort on any failure after its creation.
pub struct ReserveSpaceCompanion {
    namespace: Arc<dyn NamespaceClient>,
    pools: Arc<dyn PoolClient>,
    timeout_ms: u64,
    state: ReserveState,
}

impl ReserveSpaceCompanion {
    pub fn new(
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
        timeout_ms: u64,
    ) -> Self {
        ReserveSpaceCompanion {
            namespace,
            pools,
            timeout_ms,
            state: ReserveState::NotWaiting,
        }
    }

    fn advance(&mut self, path: &str, state: ReserveState) {
        debug!("Reserve for {}: {} -> {}", path, self.state, state);
        self.state = state;
    }

    pub async fn run(mut self, target: ReserveTarget) -> LeaseResult<ReserveOutcome> {
        let mut created_entry = false;
        let (file_id, storage_info) = match target.known.clone() {
            Some(known) => known,
            None => {
                let resolved = self.resolve(&target).await;
                match resolved {
                    Ok((id, si, created)) => {
                        created_entry = created;
                        (id, si)
                    }
                    Err(e) => return Err(self.fail(&target.path, e)),
                }
            }
        };

        let result = self
            .reserve_on_pool(&target, &file_id, &storage_info)
            .await;

        match result {
            Ok(outcome) => {
                if created_entry {
                    // The entry only existed to drive pool selection. Its
                    // removal is awaited but a failure does not undo the
                    // grant.
                    self.advance(&target.path, ReserveState::WaitingDeleteEntryResponse);
                    if let Err(e) = with_timeout(
                        self.timeout_ms,
                        "delete_entry",
                        self.namespace.delete_entry(&file_id, true),
                    )
                    .await
                    {
                        warn!(
                            "Failed to remove speculative entry {} for {}: {}",
                            file_id, target.path, e
                        );
                    }
                }
                self.advance(&target.path, ReserveState::FinalSuccess);
                info!(
                    "Reserved {} bytes for {} on pool {}",
                    target.size, target.path, outcome.pool
                );
                Ok(ReserveOutcome {
                    created_entry,
                    ..outcome
                })
            }
            Err(e) => {
                if created_entry {
                    let namespace = self.namespace.clone();
                    tokio::spawn(async move {
                        let _ = namespace.delete_entry(&file_id, false).await;
                    });
                }
                Err(self.fail(&target.path, e))
            }
        }
    }

    async fn resolve(
        &mut self,
        target: &ReserveTarget,
    ) -> LeaseResult<(FileId, StorageInfo, bool)> {
        self.advance(&target.path, ReserveState::WaitingStorageInfo);
        match with_timeout(
            self.timeout_ms,
            "get_storage_info",
            self.namespace
                .get_storage_info(&PathOrId::Path(target.path.clone())),
        )
        .await
        {
            Ok(reply) => return Ok((reply.id, reply.storage_info, false)),
            Err(LeaseError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // The file does not exist yet. Check the parent directory and, if
        // an owner was given, create the entry so a pool can be selected
        // for it.
        self.advance(&target.path, ReserveState::WaitingParentStorageInfo);
        let parent = parent_path(&target.path);
        with_timeout(
            self.timeout_ms,
            "get_storage_info",
            self.namespace.get_storage_info(&PathOrId::Path(parent)),
        )
        .await?;

        let (uid, gid) = target.owner.ok_or_else(|| {
            LeaseError::NotFound(format!(
                "{} does not exist and no owner was given to create it",
                target.path
            ))
        })?;

        self.advance(&target.path, ReserveState::WaitingCreateEntryReply);
        let reply = with_timeout(
            self.timeout_ms,
            "create_entry",
            self.namespace.create_entry(&target.path, uid, gid, 0o644),
        )
        .await?;
        Ok((reply.id, reply.storage_info, true))
    }

    async fn reserve_on_pool(
        &mut self,
        target: &ReserveTarget,
        file_id: &FileId,
        storage_info: &StorageInfo,
    ) -> LeaseResult<ReserveOutcome> {
        self.advance(&target.path, ReserveState::WaitingPoolManagerResponse);
        let hint = ProtocolHint::write_for_host(&target.client_host);
        let pool = with_timeout(
            self.timeout_ms,
            "select_write_pool",
            self.pools
                .select_write_pool(file_id, storage_info, &hint, target.size),
        )
        .await?;

        self.advance(&target.path, ReserveState::WaitingPoolResponse);
        let pool_reserved_total = with_timeout(
            self.timeout_ms,
            "reserve_space",
            self.pools.reserve_space(&pool, target.size),
        )
        .await?;

        Ok(ReserveOutcome {
            pool,
            pool_reserved_total,
            created_entry: false,
        })
    }

    fn fail(&mut self, path: &str, e: LeaseError) -> LeaseError {
        warn!(
            "Space reservation for {} failed in state {}: {}",
            path, self.state, e
        );
        self.state = ReserveState::FinalFailed;
        e
    }
}
