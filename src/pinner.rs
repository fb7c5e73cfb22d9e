use crate::collaborator::{with_timeout, NamespaceClient, PoolClient};
use crate::{FileId, LeaseError, LeaseResult, PathOrId, ProtocolHint, StorageInfo};
use log::*;
use std::fmt;
use std::sync::Arc;

/// Progress marker of a pin workflow, kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinnerState {
    Initial,
    WaitingStorageInfo,
    ReceivedStorageInfo,
    WaitingSetFlagReply,
    ReceivedSetFlagReply,
    WaitingPoolName,
    ReceivedPoolName,
    WaitingSetStickyReply,
    ReceivedSetStickyReply,
    FinalSuccess,
    FinalFailed,
}

impl fmt::Display for PinnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Forward-only workflow that turns an unpinned file into a pinned one:
/// resolve storage info, mark the namespace entry, pick a read pool, make
/// the replica sticky. The first failed step is terminal.
pub struct Pinner {
    namespace: Arc<dyn NamespaceClient>,
    pools: Arc<dyn PoolClient>,
    file_id: FileId,
    storage_info: Option<StorageInfo>,
    owner_tag: String,
    timeout_ms: u64,
    state: PinnerState,
}

impl Pinner {
    pub fn new(
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
        file_id: FileId,
        storage_info: Option<StorageInfo>,
        owner_tag: String,
        timeout_ms: u64,
    ) -> Self {
        Pinner {
            namespace,
            pools,
            file_id,
            storage_info,
            owner_tag,
            timeout_ms,
            state: PinnerState::Initial,
        }
    }

    fn advance(&mut self, state: PinnerState) {
        debug!("Pinner for {}: {} -> {}", self.file_id, self.state, state);
        self.state = state;
    }

    pub async fn run(mut self) -> LeaseResult<StorageInfo> {
        let namespace = self.namespace.clone();
        let pools = self.pools.clone();
        let file_id = self.file_id.clone();
        let owner_tag = self.owner_tag.clone();
        let timeout_ms = self.timeout_ms;

        let storage_info = match self.storage_info.take() {
            Some(si) => si,
            None => {
                self.advance(PinnerState::WaitingStorageInfo);
                let result = with_timeout(
                    timeout_ms,
                    "get_storage_info",
                    namespace.get_storage_info(&PathOrId::Id(file_id.clone())),
                )
                .await;
                let reply = match result {
                    Ok(reply) => reply,
                    Err(e) => return Err(self.fail(e)),
                };
                self.advance(PinnerState::ReceivedStorageInfo);
                reply.storage_info
            }
        };

        self.advance(PinnerState::WaitingSetFlagReply);
        let result = with_timeout(timeout_ms, "set_flag", namespace.set_flag(&file_id, "s", "*")).await;
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        self.advance(PinnerState::ReceivedSetFlagReply);

        self.advance(PinnerState::WaitingPoolName);
        let result = with_timeout(
            timeout_ms,
            "select_read_pool",
            pools.select_read_pool(&file_id, &storage_info, &ProtocolHint::read_default()),
        )
        .await;
        let pool = match result {
            Ok(pool) => pool,
            Err(e) => return Err(self.fail(e)),
        };
        self.advance(PinnerState::ReceivedPoolName);

        self.advance(PinnerState::WaitingSetStickyReply);
        let result = with_timeout(
            timeout_ms,
            "set_sticky",
            pools.set_sticky(&pool, &file_id, true, &owner_tag, None),
        )
        .await;
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        self.advance(PinnerState::ReceivedSetStickyReply);

        self.advance(PinnerState::FinalSuccess);
        info!("Pinned {} on pool {}", file_id, pool);
        Ok(storage_info)
    }

    fn fail(&mut self, e: LeaseError) -> LeaseError {
        warn!(
            "Pinner for {} failed in state {}: {}",
            self.file_id, self.state, e
        );
        self.state = PinnerState::FinalFailed;
        e
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpinnerState {
    WaitingClearFlagReply,
    ReceivedClearFlagReply,
    WaitingCacheLocations,
    ReceivedCacheLocations,
    FinalSuccess,
    FinalFailed,
}

impl fmt::Display for UnpinnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reverse workflow: clear the namespace mark, look up every replica
/// location and drop the sticky mark on each. The per-pool unsticky calls
/// are fire-and-forget, the workflow succeeds once the locations are known.
pub struct Unpinner {
    namespace: Arc<dyn NamespaceClient>,
    pools: Arc<dyn PoolClient>,
    file_id: FileId,
    owner_tag: String,
    timeout_ms: u64,
    state: UnpinnerState,
}

impl Unpinner {
    pub fn new(
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
        file_id: FileId,
        owner_tag: String,
        timeout_ms: u64,
    ) -> Self {
        Unpinner {
            namespace,
            pools,
            file_id,
            owner_tag,
            timeout_ms,
            state: UnpinnerState::WaitingClearFlagReply,
        }
    }

    fn advance(&mut self, state: UnpinnerState) {
        debug!("Unpinner for {}: {} -> {}", self.file_id, self.state, state);
        self.state = state;
    }

    pub async fn run(mut self) -> LeaseResult<()> {
        let namespace = self.namespace.clone();
        let pools = self.pools.clone();
        let file_id = self.file_id.clone();
        let owner_tag = self.owner_tag.clone();
        let timeout_ms = self.timeout_ms;

        let result = with_timeout(timeout_ms, "clear_flag", namespace.clear_flag(&file_id, "s")).await;
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        self.advance(UnpinnerState::ReceivedClearFlagReply);

        self.advance(UnpinnerState::WaitingCacheLocations);
        let result = with_timeout(
            timeout_ms,
            "get_cache_locations",
            namespace.get_cache_locations(&file_id),
        )
        .await;
        let locations = match result {
            Ok(locations) => locations,
            Err(e) => return Err(self.fail(e)),
        };
        self.advance(UnpinnerState::ReceivedCacheLocations);

        for pool in locations {
            let pools = pools.clone();
            let file_id = file_id.clone();
            let owner_tag = owner_tag.clone();
            tokio::spawn(async move {
                if let Err(e) = pools
                    .set_sticky(&pool, &file_id, false, &owner_tag, None)
                    .await
                {
                    // The replica stays sticky until the pool is reachable
                    // again; harmless for correctness, wasteful for space.
                    warn!("Failed to unstick {} on pool {}: {}", file_id, pool, e);
                }
            });
        }

        self.advance(UnpinnerState::FinalSuccess);
        info!("Unpinned {}", file_id);
        Ok(())
    }

    fn fail(&mut self, e: LeaseError) -> LeaseError {
        warn!(
            "Unpinner for {} failed in state {}: {}",
            self.file_id, self.state, e
        );
        self.state = UnpinnerState::FinalFailed;
        e
    }
}
