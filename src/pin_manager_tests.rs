use crate::collaborator::{FileMetaData, NamespaceClient, PoolClient, StorageInfoReply};
use crate::{
    FileId, LeaseError, LeaseResult, PathOrId, PinManager, PinManagerConfig, PinState,
    ProtocolHint, StorageInfo,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn init_logging() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

#[derive(Default)]
struct MockNamespace {
    calls: Mutex<Vec<String>>,
    fail: Mutex<HashMap<String, LeaseError>>,
    clear_flag_delay_ms: u64,
}

impl MockNamespace {
    fn record(&self, call: &str) -> LeaseResult<()> {
        self.calls.lock().unwrap().push(call.to_string());
        match self.fail.lock().unwrap().get(call) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    fn fail_on(&self, call: &str, e: LeaseError) {
        self.fail.lock().unwrap().insert(call.to_string(), e);
    }
}

#[async_trait]
impl NamespaceClient for MockNamespace {
    async fn get_storage_info(&self, target: &PathOrId) -> LeaseResult<StorageInfoReply> {
        self.record("get_storage_info")?;
        let id = match target {
            PathOrId::Id(id) => id.clone(),
            PathOrId::Path(path) => FileId::new(path.clone()),
        };
        Ok(StorageInfoReply {
            id,
            storage_info: StorageInfo {
                storage_class: "test:disk".to_string(),
                file_size: 4096,
            },
        })
    }

    async fn set_flag(&self, _id: &FileId, _flag: &str, _value: &str) -> LeaseResult<()> {
        self.record("set_flag")
    }

    async fn clear_flag(&self, _id: &FileId, _flag: &str) -> LeaseResult<()> {
        if self.clear_flag_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.clear_flag_delay_ms)).await;
        }
        self.record("clear_flag")
    }

    async fn create_entry(
        &self,
        path: &str,
        _uid: u32,
        _gid: u32,
        _mode: u32,
    ) -> LeaseResult<StorageInfoReply> {
        self.record("create_entry")?;
        Ok(StorageInfoReply {
            id: FileId::new(path),
            storage_info: StorageInfo {
                storage_class: "test:disk".to_string(),
                file_size: 0,
            },
        })
    }

    async fn delete_entry(&self, _id: &FileId, _reply_required: bool) -> LeaseResult<()> {
        self.record("delete_entry")
    }

    async fn get_cache_locations(&self, _id: &FileId) -> LeaseResult<Vec<String>> {
        self.record("get_cache_locations")?;
        Ok(vec!["pool_a".to_string()])
    }

    async fn get_file_meta_data(&self, _target: &PathOrId) -> LeaseResult<FileMetaData> {
        self.record("get_file_meta_data")?;
        Ok(FileMetaData {
            owner_uid: 100,
            owner_gid: 100,
            mode: 0o644,
            is_directory: false,
        })
    }
}

#[derive(Default)]
struct MockPools {
    calls: Mutex<Vec<String>>,
    fail: Mutex<HashMap<String, LeaseError>>,
    select_delay_ms: u64,
    sticky: Mutex<Vec<(String, String, bool)>>,
}

impl MockPools {
    fn record(&self, call: &str) -> LeaseResult<()> {
        self.calls.lock().unwrap().push(call.to_string());
        match self.fail.lock().unwrap().get(call) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    fn fail_on(&self, call: &str, e: LeaseError) {
        self.fail.lock().unwrap().insert(call.to_string(), e);
    }
}

#[async_trait]
impl PoolClient for MockPools {
    async fn select_read_pool(
        &self,
        _id: &FileId,
        _storage_info: &StorageInfo,
        _hint: &ProtocolHint,
    ) -> LeaseResult<String> {
        if self.select_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.select_delay_ms)).await;
        }
        self.record("select_read_pool")?;
        Ok("pool_a".to_string())
    }

    async fn select_write_pool(
        &self,
        _id: &FileId,
        _storage_info: &StorageInfo,
        _hint: &ProtocolHint,
        _preallocated: u64,
    ) -> LeaseResult<String> {
        self.record("select_write_pool")?;
        Ok("pool_a".to_string())
    }

    async fn set_sticky(
        &self,
        pool: &str,
        id: &FileId,
        sticky: bool,
        _owner_tag: &str,
        _lifetime: Option<Duration>,
    ) -> LeaseResult<()> {
        self.record("set_sticky")?;
        self.sticky
            .lock()
            .unwrap()
            .push((pool.to_string(), id.to_string(), sticky));
        Ok(())
    }

    async fn reserve_space(&self, _pool: &str, size: u64) -> LeaseResult<u64> {
        self.record("reserve_space")?;
        Ok(size)
    }

    async fn release_space(&self, _pool: &str, _size: u64) -> LeaseResult<u64> {
        self.record("release_space")?;
        Ok(0)
    }

    async fn sync_reserved(&self, _pool: &str, _total: u64) -> LeaseResult<()> {
        self.record("sync_reserved")
    }
}

struct Fixture {
    _dir: TempDir,
    manager: Arc<PinManager>,
    namespace: Arc<MockNamespace>,
    pools: Arc<MockPools>,
}

fn make_fixture(namespace: MockNamespace, pools: MockPools) -> Fixture {
    init_logging();
    let dir = TempDir::new().unwrap();
    let namespace = Arc::new(namespace);
    let pools = Arc::new(pools);
    let manager = PinManager::new(
        PinManagerConfig {
            db_path: dir.path().join("pins.db"),
            max_pin_duration_ms: 24 * 60 * 60 * 1000,
            call_timeout_ms: 5000,
            owner_tag: "PinManager".to_string(),
        },
        namespace.clone(),
        pools.clone(),
    )
    .unwrap();
    Fixture {
        _dir: dir,
        manager,
        namespace,
        pools,
    }
}

async fn wait_for_gone(manager: &Arc<PinManager>, file_id: &FileId) {
    for _ in 0..100 {
        if manager.pin_state(file_id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never left the index", file_id);
}

#[tokio::test]
async fn test_pin_then_unpin() {
    let fx = make_fixture(MockNamespace::default(), MockPools::default());
    let file_id = FileId::new("000A");

    let lease = fx.manager.pin(file_id.clone(), 60_000, 1).await.unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinned));
    assert_eq!(fx.pools.count("set_sticky"), 1);
    assert_eq!(fx.namespace.count("set_flag"), 1);

    fx.manager.flush_bookkeeping().await;
    assert!(fx.manager.list_pins().contains(&format!("lease {}", lease)));

    fx.manager.unpin(&file_id, lease).unwrap();
    wait_for_gone(&fx.manager, &file_id).await;

    // The unpinner cleared the flag and unstuck every replica.
    assert_eq!(fx.namespace.count("clear_flag"), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sticky = fx.pools.sticky.lock().unwrap().clone();
    assert_eq!(sticky.last().unwrap().2, false);

    fx.manager.flush_bookkeeping().await;
    assert_eq!(fx.manager.list_pins(), "no files are pinned");
}

#[tokio::test]
async fn test_concurrent_pins_share_one_protocol_run() {
    let pools = MockPools {
        select_delay_ms: 100,
        ..Default::default()
    };
    let fx = make_fixture(MockNamespace::default(), pools);
    let file_id = FileId::new("000B");

    let mut handles = Vec::new();
    for i in 0..5 {
        let manager = fx.manager.clone();
        let file_id = file_id.clone();
        handles.push(tokio::spawn(async move {
            manager.pin(file_id, 60_000, i).await
        }));
    }

    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap().unwrap());
    }
    leases.sort();
    leases.dedup();
    assert_eq!(leases.len(), 5);

    // One pin workflow served all five leases.
    assert_eq!(fx.pools.count("select_read_pool"), 1);
    assert_eq!(fx.pools.count("set_sticky"), 1);
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinned));
}

#[tokio::test]
async fn test_pin_failure_fans_out_to_all_waiters() {
    let pools = MockPools {
        select_delay_ms: 50,
        ..Default::default()
    };
    pools.fail_on(
        "set_sticky",
        LeaseError::Collaborator("pool refused sticky".to_string()),
    );
    let fx = make_fixture(MockNamespace::default(), pools);
    let file_id = FileId::new("000C");

    let mut handles = Vec::new();
    for i in 0..3 {
        let manager = fx.manager.clone();
        let file_id = file_id.clone();
        handles.push(tokio::spawn(async move {
            manager.pin(file_id, 60_000, i).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LeaseError::Collaborator(_))));
    }

    assert_eq!(fx.manager.pin_state(&file_id), None);
    fx.manager.flush_bookkeeping().await;
    assert_eq!(fx.manager.list_pins(), "no files are pinned");
}

#[tokio::test]
async fn test_lease_expiry_unpins_file() {
    let fx = make_fixture(MockNamespace::default(), MockPools::default());
    let file_id = FileId::new("000D");

    let lease = fx.manager.pin(file_id.clone(), 50, 0).await.unwrap();
    wait_for_gone(&fx.manager, &file_id).await;
    assert_eq!(fx.namespace.count("clear_flag"), 1);

    let result = fx.manager.unpin(&file_id, lease);
    assert!(matches!(result, Err(LeaseError::NotFound(_))));
}

#[tokio::test]
async fn test_states_are_observable_through_the_cycle() {
    let namespace = MockNamespace {
        clear_flag_delay_ms: 100,
        ..Default::default()
    };
    let pools = MockPools {
        select_delay_ms: 100,
        ..Default::default()
    };
    let fx = make_fixture(namespace, pools);
    let file_id = FileId::new("000E");

    let lease = fx.manager.pin_detached(file_id.clone(), 60_000, 0).unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinning));

    for _ in 0..100 {
        if fx.manager.pin_state(&file_id) == Some(PinState::Pinned) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinned));

    fx.manager.unpin(&file_id, lease).unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Unpinning));
    wait_for_gone(&fx.manager, &file_id).await;
}

#[tokio::test]
async fn test_last_lease_removed_while_pinning() {
    let namespace = MockNamespace {
        clear_flag_delay_ms: 100,
        ..Default::default()
    };
    let pools = MockPools {
        select_delay_ms: 100,
        ..Default::default()
    };
    let fx = make_fixture(namespace, pools);
    let file_id = FileId::new("0014");

    let lease = fx.manager.pin_detached(file_id.clone(), 60_000, 0).unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinning));

    // The only lease goes away while the pin protocol is still in
    // flight; the aggregate must stay queryable until the handler is
    // done with it.
    fx.manager.unpin(&file_id, lease).unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinning));

    // Pinning completes into an empty lease set, rolls straight into
    // unpinning, and only then does the aggregate go away.
    let mut saw_unpinning = false;
    for _ in 0..100 {
        match fx.manager.pin_state(&file_id) {
            None => break,
            Some(PinState::Unpinning) => saw_unpinning = true,
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_unpinning);
    assert_eq!(fx.manager.pin_state(&file_id), None);
    assert_eq!(fx.namespace.count("clear_flag"), 1);

    fx.manager.flush_bookkeeping().await;
    assert_eq!(fx.manager.list_pins(), "no files are pinned");
}

#[tokio::test]
async fn test_repin_while_unpinning_ends_pinned() {
    let namespace = MockNamespace {
        clear_flag_delay_ms: 100,
        ..Default::default()
    };
    let fx = make_fixture(namespace, MockPools::default());
    let file_id = FileId::new("000F");

    let lease = fx.manager.pin(file_id.clone(), 60_000, 0).await.unwrap();
    fx.manager.unpin(&file_id, lease).unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Unpinning));

    // A new lease arrives while the unpinner is still at work; when it
    // finishes, the file must be pinned again for the new lease.
    let lease2 = fx.manager.pin(file_id.clone(), 60_000, 1).await.unwrap();
    assert_eq!(fx.manager.pin_state(&file_id), Some(PinState::Pinned));
    assert!(fx.pools.count("set_sticky") >= 2);

    fx.manager.unpin(&file_id, lease2).unwrap();
    wait_for_gone(&fx.manager, &file_id).await;
}

#[tokio::test]
async fn test_extend_lifetime() {
    let fx = make_fixture(MockNamespace::default(), MockPools::default());
    let file_id = FileId::new("0010");

    let lease = fx
        .manager
        .pin(file_id.clone(), 60 * 60 * 1000, 0)
        .await
        .unwrap();
    fx.manager.flush_bookkeeping().await;
    let before = crate::PinDb::new(&fx._dir.path().join("pins.db"))
        .unwrap()
        .load_all()
        .unwrap()[0]
        .expiration;

    // Shorter than what is left, nothing changes.
    fx.manager
        .extend_lifetime(&file_id, lease, 60_000)
        .unwrap();
    fx.manager.flush_bookkeeping().await;
    let after_noop = crate::PinDb::new(&fx._dir.path().join("pins.db"))
        .unwrap()
        .load_all()
        .unwrap()[0]
        .expiration;
    assert_eq!(before, after_noop);

    // Longer, the expiration moves out.
    fx.manager
        .extend_lifetime(&file_id, lease, 2 * 60 * 60 * 1000)
        .unwrap();
    fx.manager.flush_bookkeeping().await;
    let after = crate::PinDb::new(&fx._dir.path().join("pins.db"))
        .unwrap()
        .load_all()
        .unwrap()[0]
        .expiration;
    assert!(after > before);

    let unknown = fx.manager.extend_lifetime(&file_id, lease + 999, 60_000);
    assert!(matches!(unknown, Err(LeaseError::NotFound(_))));
}

#[tokio::test]
async fn test_recovery_restores_leases_with_grace() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pins.db");
    let now = crate::unix_millis();

    {
        let db = crate::PinDb::new(&db_path).unwrap();
        db.insert(&crate::PinRequestRecord {
            pin_request_id: 5,
            file_id: FileId::new("00AA"),
            expiration: now.saturating_sub(10_000),
            client_request_id: 0,
        })
        .unwrap();
        db.insert(&crate::PinRequestRecord {
            pin_request_id: 6,
            file_id: FileId::new("00BB"),
            expiration: now + 60 * 60 * 1000,
            client_request_id: 0,
        })
        .unwrap();
    }

    let namespace = Arc::new(MockNamespace::default());
    let pools = Arc::new(MockPools::default());
    let manager = PinManager::new(
        PinManagerConfig {
            db_path: db_path.clone(),
            max_pin_duration_ms: 24 * 60 * 60 * 1000,
            call_timeout_ms: 5000,
            owner_tag: "PinManager".to_string(),
        },
        namespace,
        pools,
    )
    .unwrap();

    manager.recover().unwrap();
    assert_eq!(
        manager.pin_state(&FileId::new("00AA")),
        Some(PinState::Pinned)
    );
    assert_eq!(
        manager.pin_state(&FileId::new("00BB")),
        Some(PinState::Pinned)
    );

    // The expired lease got a fresh grace lifetime rather than firing
    // right away.
    manager.flush_bookkeeping().await;
    let rows = crate::PinDb::new(&db_path).unwrap().load_all().unwrap();
    let graced = rows.iter().find(|r| r.pin_request_id == 5).unwrap();
    assert!(graced.expiration > now);
}

#[tokio::test]
async fn test_max_pin_duration_clamps_requests() {
    let fx = make_fixture(MockNamespace::default(), MockPools::default());
    let file_id = FileId::new("0011");

    fx.manager.set_max_pin_duration(5000).unwrap();
    assert_eq!(fx.manager.get_max_pin_duration(), 5000);

    let before = crate::unix_millis();
    fx.manager
        .pin(file_id.clone(), 365 * 24 * 60 * 60 * 1000, 0)
        .await
        .unwrap();
    fx.manager.flush_bookkeeping().await;
    let rows = crate::PinDb::new(&fx._dir.path().join("pins.db"))
        .unwrap()
        .load_all()
        .unwrap();
    assert!(rows[0].expiration <= before + 30_000);

    assert!(matches!(
        fx.manager.set_max_pin_duration(0),
        Err(LeaseError::InvalidParam(_))
    ));
}

#[tokio::test]
async fn test_unpin_unknown_lease() {
    let fx = make_fixture(MockNamespace::default(), MockPools::default());
    let file_id = FileId::new("0012");

    let result = fx.manager.unpin(&file_id, 1);
    assert!(matches!(result, Err(LeaseError::NotFound(_))));

    let lease = fx.manager.pin(file_id.clone(), 60_000, 0).await.unwrap();
    let result = fx.manager.unpin(&file_id, lease + 1);
    assert!(matches!(result, Err(LeaseError::NotFound(_))));
    fx.manager.unpin(&file_id, lease).unwrap();
}

#[tokio::test]
async fn test_zero_lifetime_is_rejected() {
    let fx = make_fixture(MockNamespace::default(), MockPools::default());
    let result = fx.manager.pin(FileId::new("0013"), 0, 0).await;
    assert!(matches!(result, Err(LeaseError::InvalidParam(_))));
}
