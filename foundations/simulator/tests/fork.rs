use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use moonwall_foundation_core::{
    Cleanup, DynError, Foundation as _, FoundationStatus, HealthCheckReason, StartupReason,
    config::{BuildBlockMode, ChainType, ForkConfig},
    policy::OperationKind,
};
use moonwall_foundation_simulator::{
    BlockError, BlockId, BlockSummary, CreateBlockParams, ForkFoundation, ForkLauncher,
    ForkService, LaunchedFork, StorageError, StorageWrite,
};
use serde_json::json;

#[derive(Default)]
struct FakeFork {
    head: Mutex<Option<BlockSummary>>,
    writes: Mutex<Vec<StorageWrite>>,
    block_delay: Duration,
    head_delay: Duration,
    heads: Mutex<Vec<BlockId>>,
}

#[async_trait]
impl ForkService for FakeFork {
    async fn create_block(&self, params: CreateBlockParams) -> Result<BlockSummary, DynError> {
        tokio::time::sleep(self.block_delay).await;
        let mut head = self.head.lock().unwrap();
        let number =
            head.as_ref().map_or(0, |block| block.number) + u64::from(params.count.unwrap_or(1));
        let block = BlockSummary {
            hash: format!("0x{number:064x}"),
            number,
        };
        *head = Some(block.clone());
        Ok(block)
    }

    async fn set_storage(&self, write: StorageWrite) -> Result<(), DynError> {
        self.writes.lock().unwrap().push(write);
        Ok(())
    }

    async fn get_block(&self, id: Option<BlockId>) -> Result<Option<BlockSummary>, DynError> {
        let head = self.head.lock().unwrap().clone();
        Ok(match id {
            None => head,
            Some(BlockId::Number(number)) => head.filter(|block| block.number == number),
            Some(BlockId::Hash(hash)) => head.filter(|block| block.hash == hash),
        })
    }

    async fn set_head(&self, id: BlockId) -> Result<(), DynError> {
        tokio::time::sleep(self.head_delay).await;
        self.heads.lock().unwrap().push(id);
        Ok(())
    }
}

struct FakeLauncher {
    service: Arc<FakeFork>,
    released: Arc<AtomicBool>,
    fail: bool,
}

impl FakeLauncher {
    fn new(service: FakeFork) -> Self {
        Self {
            service: Arc::new(service),
            released: Arc::new(AtomicBool::new(false)),
            fail: false,
        }
    }
}

#[async_trait]
impl ForkLauncher for FakeLauncher {
    async fn launch(&self, config: &ForkConfig) -> Result<LaunchedFork, DynError> {
        if self.fail {
            return Err("chopsticks could not fetch the runtime".into());
        }
        let released = Arc::clone(&self.released);
        Ok(LaunchedFork {
            address: "localhost".to_owned(),
            port: config.ws_port.unwrap_or(8000),
            service: Arc::clone(&self.service) as Arc<dyn ForkService>,
            cleanup: Cleanup::new("fake chopsticks", move || async move {
                released.store(true, Ordering::SeqCst);
                Ok(())
            }),
        })
    }
}

fn config() -> ForkConfig {
    ForkConfig {
        name: "polkadot-fork".to_owned(),
        config_path: PathBuf::from("configs/polkadot.yml"),
        ws_port: None,
        chain_type: ChainType::Relaychain,
        wasm_override: None,
        build_block_mode: BuildBlockMode::Manual,
        startup_timeout_ms: None,
    }
}

#[tokio::test]
async fn block_and_storage_operations_while_running() {
    let launcher = Arc::new(FakeLauncher::new(FakeFork::default()));
    let released = Arc::clone(&launcher.released);
    let service = Arc::clone(&launcher.service);
    let foundation = ForkFoundation::new(launcher);

    let started = foundation.start(config()).await.unwrap();
    assert_eq!(started.info.endpoint, "ws://localhost:8000");
    assert!(foundation.status().is_active());

    let block = foundation
        .create_block(CreateBlockParams {
            count: Some(2),
            ..CreateBlockParams::default()
        })
        .await
        .unwrap();
    assert_eq!(block.number, 2);
    assert_eq!(foundation.get_block(None).await.unwrap(), Some(block.clone()));
    assert_eq!(
        foundation.get_block(Some(BlockId::Number(2))).await.unwrap(),
        Some(block)
    );

    foundation
        .set_storage(StorageWrite {
            module: "System".to_owned(),
            method: "Account".to_owned(),
            params: json!([]),
        })
        .await
        .unwrap();
    assert_eq!(service.writes.lock().unwrap().len(), 1);

    foundation.set_head(BlockId::Number(1)).await.unwrap();
    assert_eq!(*service.heads.lock().unwrap(), vec![BlockId::Number(1)]);

    foundation.health_check(None).await.unwrap();

    foundation.stop().await.unwrap();
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(foundation.status(), FoundationStatus::Stopped);
    assert!(matches!(
        foundation.create_block(CreateBlockParams::default()).await,
        Err(BlockError::NotRunning)
    ));
    assert!(matches!(
        foundation
            .set_storage(StorageWrite {
                module: "System".to_owned(),
                method: "Number".to_owned(),
                params: json!(1),
            })
            .await,
        Err(StorageError::NotRunning)
    ));
    assert!(matches!(
        foundation.get_block(None).await,
        Err(BlockError::NotRunning)
    ));
    assert!(matches!(
        foundation.set_head(BlockId::Number(1)).await,
        Err(BlockError::NotRunning)
    ));
}

#[tokio::test]
async fn missing_head_block_fails_health_check() {
    let foundation = ForkFoundation::new(Arc::new(FakeLauncher::new(FakeFork::default())));
    let started = foundation.start(config()).await.unwrap();

    let error = foundation.health_check(None).await.unwrap_err();

    assert!(matches!(error.reason(), HealthCheckReason::Probe(_)));
    assert!(error.to_string().contains("no head block"));
    started.stop.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_block_creation_times_out() {
    let foundation = ForkFoundation::new(Arc::new(FakeLauncher::new(FakeFork {
        block_delay: Duration::from_secs(120),
        ..FakeFork::default()
    })));
    let started = foundation.start(config()).await.unwrap();

    let error = foundation
        .create_block(CreateBlockParams::default())
        .await
        .unwrap_err();

    match error {
        BlockError::Timeout(timeout) => assert_eq!(timeout.timeout_ms(), 30_000),
        other => panic!("unexpected error: {other}"),
    }
    started.stop.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_set_head_uses_the_rpc_call_deadline() {
    let foundation = ForkFoundation::new(Arc::new(FakeLauncher::new(FakeFork {
        head_delay: Duration::from_secs(60),
        ..FakeFork::default()
    })));
    let started = foundation.start(config()).await.unwrap();

    let error = foundation
        .set_head(BlockId::Hash("0xabc".to_owned()))
        .await
        .unwrap_err();

    match error {
        BlockError::Timeout(timeout) => {
            assert_eq!(timeout.kind(), OperationKind::RpcCall);
            assert_eq!(timeout.timeout_ms(), 10_000);
            assert!(timeout.description().contains("to 0xabc"));
        }
        other => panic!("unexpected error: {other}"),
    }
    started.stop.stop().await.unwrap();
}

#[tokio::test]
async fn launcher_failure_is_a_startup_error() {
    let mut launcher = FakeLauncher::new(FakeFork::default());
    launcher.fail = true;
    let foundation = ForkFoundation::new(Arc::new(launcher));

    let error = foundation.start(config()).await.unwrap_err();

    assert!(matches!(error.reason(), StartupReason::Simulator(_)));
    assert!(error.to_string().contains("polkadot-fork"));
    assert!(matches!(foundation.status(), FoundationStatus::Failed { .. }));
}
