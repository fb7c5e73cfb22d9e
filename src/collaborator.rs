use crate::{FileId, LeaseError, LeaseResult, PathOrId, ProtocolHint, StorageInfo};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Reply to a namespace lookup: the resolved id plus its storage info.
#[derive(Debug, Clone)]
pub struct StorageInfoReply {
    pub id: FileId,
    pub storage_info: StorageInfo,
}

#[derive(Debug, Clone)]
pub struct FileMetaData {
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub mode: u32,
    pub is_directory: bool,
}

/// Namespace side of the collaboration. One outstanding request at a time
/// per workflow; every call is awaited under a bounded timeout by the caller.
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    async fn get_storage_info(&self, target: &PathOrId) -> LeaseResult<StorageInfoReply>;

    async fn set_flag(&self, id: &FileId, flag: &str, value: &str) -> LeaseResult<()>;

    async fn clear_flag(&self, id: &FileId, flag: &str) -> LeaseResult<()>;

    async fn create_entry(
        &self,
        path: &str,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> LeaseResult<StorageInfoReply>;

    /// `reply_required` = false makes the removal fire-and-forget on the
    /// remote side; the local call still completes immediately.
    async fn delete_entry(&self, id: &FileId, reply_required: bool) -> LeaseResult<()>;

    async fn get_cache_locations(&self, id: &FileId) -> LeaseResult<Vec<String>>;

    async fn get_file_meta_data(&self, target: &PathOrId) -> LeaseResult<FileMetaData>;
}

/// Pool side of the collaboration: pool selection plus per-pool sticky and
/// space operations.
#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn select_read_pool(
        &self,
        id: &FileId,
        storage_info: &StorageInfo,
        hint: &ProtocolHint,
    ) -> LeaseResult<String>;

    async fn select_write_pool(
        &self,
        id: &FileId,
        storage_info: &StorageInfo,
        hint: &ProtocolHint,
        preallocated: u64,
    ) -> LeaseResult<String>;

    /// `lifetime` None means the sticky mark does not expire on its own.
    async fn set_sticky(
        &self,
        pool: &str,
        id: &FileId,
        sticky: bool,
        owner_tag: &str,
        lifetime: Option<Duration>,
    ) -> LeaseResult<()>;

    /// Returns the pool's total reserved bytes after the reservation.
    async fn reserve_space(&self, pool: &str, size: u64) -> LeaseResult<u64>;

    /// Returns the pool's total reserved bytes after the release.
    async fn release_space(&self, pool: &str, size: u64) -> LeaseResult<u64>;

    /// Overwrite the pool's reserved total with a recomputed value.
    async fn sync_reserved(&self, pool: &str, total: u64) -> LeaseResult<()>;
}

/// Bound a collaborator call. Elapsed timers surface as `LeaseError::Timeout`
/// and travel the same failure path as a negative reply.
pub async fn with_timeout<T, F>(timeout_ms: u64, what: &str, fut: F) -> LeaseResult<T>
where
    F: Future<Output = LeaseResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(LeaseError::Timeout(format!(
            "{} did not reply within {}ms",
            what, timeout_ms
        ))),
    }
}
