use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use moonwall_foundation_core::{
    DynError, Foundation as _, FoundationStatus, HealthCheckReason, StartupReason,
    config::DevConfig, readiness::ReadinessProbe,
};
use moonwall_foundation_dev::{
    DevFoundation, RPC_PORT_ENV,
    discovery::{PortDiscovery, PortSource},
};
use serial_test::serial;

struct FixedPorts {
    ports: Vec<u16>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl PortSource for FixedPorts {
    async fn listening_ports(&self, _: u32) -> Result<Vec<u16>, DynError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ports.clone())
    }
}

struct StaticProbe(bool);

#[async_trait]
impl ReadinessProbe for StaticProbe {
    async fn probe(&self, _: &str, _: bool) -> Result<bool, DynError> {
        Ok(self.0)
    }
}

/// Ready only on one port, and only when asked with the expected chain flavour.
struct PortProbe {
    port: u16,
    is_ethereum_chain: bool,
}

#[async_trait]
impl ReadinessProbe for PortProbe {
    async fn probe(&self, endpoint: &str, is_ethereum_chain: bool) -> Result<bool, DynError> {
        Ok(endpoint.ends_with(&format!(":{}", self.port))
            && is_ethereum_chain == self.is_ethereum_chain)
    }
}

fn foundation(ports: Vec<u16>, ready: bool) -> (DevFoundation, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let source = FixedPorts {
        ports,
        calls: Arc::clone(&calls),
    };
    let foundation = DevFoundation::new()
        .with_port_discovery(
            PortDiscovery::new(Arc::new(source)).with_max_attempts(3, Duration::from_millis(10)),
        )
        .with_probe(Arc::new(StaticProbe(ready)));
    (foundation, calls)
}

fn sleeper(log_directory: &Path) -> DevConfig {
    DevConfig {
        name: "sleeper".to_owned(),
        command: "sh".to_owned(),
        args: vec!["-c".to_owned(), "exec sleep 30".to_owned()],
        is_ethereum_chain: false,
        log_directory: Some(log_directory.to_path_buf()),
        startup_timeout_ms: Some(5_000),
    }
}

fn single_log(directory: &Path) -> PathBuf {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(directory)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1, "{entries:?}");
    entries.remove(0)
}

async fn wait_for_status_line(path: &Path, expected: &str) {
    for _ in 0..100 {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        if contents.lines().last().is_some_and(|line| line.ends_with(expected)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never ended with {expected}", path.display());
}

#[tokio::test]
#[serial]
async fn start_health_check_and_stop() {
    std::env::remove_var(RPC_PORT_ENV);
    let logs = tempfile::tempdir().unwrap();
    let (foundation, _) = foundation(vec![30333, 9944], true);
    let mut statuses = foundation.subscribe_status();
    assert_eq!(foundation.status(), FoundationStatus::Stopped);

    let started = foundation.start(sleeper(logs.path())).await.unwrap();

    assert_eq!(started.info.port, 9944);
    assert_eq!(started.info.endpoint, "ws://localhost:9944");
    assert!(started
        .info
        .process
        .args()
        .contains(&"--rpc-port=0".to_owned()));
    assert_eq!(
        foundation.status(),
        FoundationStatus::Running {
            endpoint: "ws://localhost:9944".to_owned(),
            pid: Some(started.info.process.pid()),
        }
    );
    assert!(statuses.has_changed().unwrap());
    assert!(statuses.borrow_and_update().is_active());

    foundation.health_check(None).await.unwrap();

    foundation.stop().await.unwrap();
    assert_eq!(foundation.status(), FoundationStatus::Stopped);
    wait_for_status_line(&started.info.log_path, "process killed").await;

    // The per-run handle has nothing left to do.
    started.stop.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn discovery_picks_the_port_that_answers() {
    std::env::remove_var(RPC_PORT_ENV);
    let logs = tempfile::tempdir().unwrap();
    let source = FixedPorts {
        ports: vec![40000, 9944],
        calls: Arc::new(AtomicU32::new(0)),
    };
    let foundation = DevFoundation::new()
        .with_probe(Arc::new(PortProbe {
            port: 9944,
            is_ethereum_chain: true,
        }))
        .with_port_discovery(
            PortDiscovery::new(Arc::new(source)).with_max_attempts(3, Duration::from_millis(10)),
        );
    let mut config = sleeper(logs.path());
    config.is_ethereum_chain = true;

    let started = foundation.start(config).await.unwrap();

    assert_eq!(started.info.port, 9944);
    started.stop.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn second_start_is_rejected() {
    std::env::remove_var(RPC_PORT_ENV);
    let logs = tempfile::tempdir().unwrap();
    let (foundation, _) = foundation(vec![9944], true);
    let started = foundation.start(sleeper(logs.path())).await.unwrap();

    let error = foundation.start(sleeper(logs.path())).await.unwrap_err();

    assert!(matches!(error.reason(), StartupReason::AlreadyRunning));
    assert!(foundation.status().is_active());
    started.stop.stop().await.unwrap();
    assert_eq!(foundation.status(), FoundationStatus::Stopped);
}

#[tokio::test]
#[serial]
async fn failed_discovery_kills_the_process() {
    std::env::remove_var(RPC_PORT_ENV);
    let logs = tempfile::tempdir().unwrap();
    let (foundation, calls) = foundation(vec![30333], true);

    let error = foundation.start(sleeper(logs.path())).await.unwrap_err();

    match error.reason() {
        StartupReason::Discovery(discovery) => assert_eq!(discovery.attempts(), 3),
        other => panic!("unexpected reason: {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(foundation.status(), FoundationStatus::Failed { .. }));
    wait_for_status_line(&single_log(logs.path()), "process killed").await;
}

#[tokio::test]
#[serial]
async fn startup_timeout_releases_the_process() {
    std::env::remove_var(RPC_PORT_ENV);
    let logs = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let foundation = DevFoundation::new().with_port_discovery(
        PortDiscovery::new(Arc::new(FixedPorts {
            ports: Vec::new(),
            calls: Arc::clone(&calls),
        }))
        .with_max_attempts(1_000, Duration::from_millis(20)),
    );
    let mut config = sleeper(logs.path());
    config.startup_timeout_ms = Some(300);

    let error = foundation.start(config).await.unwrap_err();

    match error.reason() {
        StartupReason::Timeout(timeout) => assert_eq!(timeout.timeout_ms(), 300),
        other => panic!("unexpected reason: {other}"),
    }
    assert!(matches!(foundation.status(), FoundationStatus::Failed { .. }));
    wait_for_status_line(&single_log(logs.path()), "process killed").await;
}

#[tokio::test]
#[serial]
async fn preallocated_port_skips_discovery() {
    std::env::set_var(RPC_PORT_ENV, "9977");
    let logs = tempfile::tempdir().unwrap();
    let (foundation, calls) = foundation(vec![9944], true);

    let started = foundation.start(sleeper(logs.path())).await.unwrap();
    std::env::remove_var(RPC_PORT_ENV);

    assert_eq!(started.info.port, 9977);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(started
        .info
        .process
        .args()
        .contains(&"--rpc-port=9977".to_owned()));
    assert!(started.info.log_path.to_string_lossy().contains("_node_9977_"));
    started.stop.stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn health_check_reports_state_and_readiness_failures() {
    std::env::remove_var(RPC_PORT_ENV);
    let logs = tempfile::tempdir().unwrap();
    let (foundation, _) = foundation(vec![9944], false);

    let idle = foundation.health_check(None).await.unwrap_err();
    assert!(matches!(idle.reason(), HealthCheckReason::NotRunning { .. }));

    let started = foundation.start(sleeper(logs.path())).await.unwrap();
    let unhealthy = foundation.health_check(None).await.unwrap_err();
    assert!(matches!(unhealthy.reason(), HealthCheckReason::NotReady));
    assert!(foundation.status().is_active());

    started.stop.stop().await.unwrap();
}
