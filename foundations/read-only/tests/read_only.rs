use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use moonwall_foundation_core::{
    DynError, Foundation as _, FoundationStatus, HealthCheckReason, StartupReason,
    config::ReadOnlyConfig,
    provider::{
        ConnectOptions, Greeting, ProviderClient, ProviderConfig, ProviderConnectionError,
        ProviderFactory, ProviderKind,
    },
};
use moonwall_foundation_read_only::ReadOnlyFoundation;

type Journal = Arc<Mutex<Vec<String>>>;

struct FakeClient {
    name: String,
    refuse: bool,
    stall: bool,
    greet_fails: bool,
    greet_stalls: bool,
    journal: Journal,
}

impl FakeClient {
    fn record(&self, event: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{event} {}", self.name));
    }
}

#[async_trait]
impl ProviderClient for FakeClient {
    async fn connect(&self) -> Result<(), DynError> {
        self.record("connect");
        if self.stall {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.refuse {
            return Err(format!("{} refused", self.name).into());
        }
        Ok(())
    }

    async fn greet(&self) -> Result<Greeting, DynError> {
        self.record("greet");
        if self.greet_stalls {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.greet_fails {
            return Err("runtime version unavailable".into());
        }
        Ok(Greeting {
            chain: format!("{} chain", self.name),
            spec_version: Some(3000),
        })
    }

    async fn disconnect(&self) -> Result<(), DynError> {
        self.record("disconnect");
        Ok(())
    }
}

#[derive(Default)]
struct FakeFactory {
    refusing: Vec<&'static str>,
    stalling: Vec<&'static str>,
    greet_failing: Vec<&'static str>,
    greet_stalling: Vec<&'static str>,
    journal: Journal,
}

impl ProviderFactory for FakeFactory {
    fn prepare(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderClient>, ProviderConnectionError> {
        Ok(Arc::new(FakeClient {
            name: config.name.clone(),
            refuse: self.refusing.contains(&config.name.as_str()),
            stall: self.stalling.contains(&config.name.as_str()),
            greet_fails: self.greet_failing.contains(&config.name.as_str()),
            greet_stalls: self.greet_stalling.contains(&config.name.as_str()),
            journal: Arc::clone(&self.journal),
        }))
    }
}

fn foundation(factory: FakeFactory) -> ReadOnlyFoundation {
    ReadOnlyFoundation::new(
        Arc::new(factory),
        ConnectOptions {
            connection_timeout: Duration::from_secs(1),
            retry_attempts: 1,
            retry_delay: Duration::from_millis(10),
        },
    )
}

fn config(names: &[&str]) -> ReadOnlyConfig {
    ReadOnlyConfig {
        name: "live".to_owned(),
        connections: names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                ProviderConfig::new(
                    *name,
                    ProviderKind::PolkadotJs,
                    format!("ws://localhost:{}", 9944 + index),
                )
            })
            .collect(),
        disable_runtime_version_check: false,
        startup_timeout_ms: None,
    }
}

fn events(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[tokio::test]
async fn empty_connections_fail_immediately() {
    let read_only = foundation(FakeFactory::default());

    let error = read_only.start(config(&[])).await.unwrap_err();

    assert!(matches!(error.reason(), StartupReason::NoConnections));
    assert!(matches!(read_only.status(), FoundationStatus::Failed { .. }));
}

#[tokio::test]
async fn connects_every_provider_and_disconnects_them() {
    let journal = Journal::default();
    let read_only = foundation(FakeFactory {
        journal: Arc::clone(&journal),
        ..FakeFactory::default()
    });

    let started = read_only.connect(config(&["relay", "para"])).await.unwrap();

    assert_eq!(started.info.providers.len(), 2);
    assert_eq!(
        read_only.status(),
        FoundationStatus::Connected {
            count: 2,
            endpoints: vec!["ws://localhost:9944".to_owned(), "ws://localhost:9945".to_owned()],
        }
    );
    assert_eq!(
        events(&journal),
        ["connect relay", "connect para", "greet relay", "greet para"]
    );

    read_only.disconnect().await.unwrap();

    assert_eq!(read_only.status(), FoundationStatus::Disconnected);
    let log = events(&journal);
    assert_eq!(&log[4..], ["disconnect para", "disconnect relay"]);

    read_only.disconnect().await.unwrap();
    assert_eq!(events(&journal).len(), 6);
}

#[tokio::test]
async fn a_refused_provider_rolls_back_the_others() {
    let journal = Journal::default();
    let read_only = foundation(FakeFactory {
        refusing: vec!["para"],
        journal: Arc::clone(&journal),
        ..FakeFactory::default()
    });

    let error = read_only.start(config(&["relay", "para"])).await.unwrap_err();

    let StartupReason::Provider(connection) = error.reason() else {
        panic!("unexpected reason: {error}");
    };
    assert_eq!(connection.name(), "para");
    assert!(events(&journal).contains(&"disconnect relay".to_owned()));
    assert!(matches!(read_only.status(), FoundationStatus::Failed { .. }));
}

#[tokio::test(start_paused = true)]
async fn startup_timeout_disconnects_providers_already_connected() {
    let journal = Journal::default();
    let read_only = foundation(FakeFactory {
        stalling: vec!["slow"],
        journal: Arc::clone(&journal),
        ..FakeFactory::default()
    });
    let mut config = config(&["relay", "slow"]);
    config.startup_timeout_ms = Some(100);

    let error = read_only.start(config).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(matches!(error.reason(), StartupReason::Timeout(_)));
    assert_eq!(
        events(&journal),
        ["connect relay", "connect slow", "disconnect relay"]
    );
    assert!(matches!(read_only.status(), FoundationStatus::Failed { .. }));
}

#[tokio::test]
async fn greeting_failures_do_not_block_startup() {
    let journal = Journal::default();
    let read_only = foundation(FakeFactory {
        greet_failing: vec!["relay"],
        journal: Arc::clone(&journal),
        ..FakeFactory::default()
    });

    read_only.start(config(&["relay"])).await.unwrap();

    assert!(read_only.status().is_active());
    read_only.stop().await.unwrap();
}

#[tokio::test]
async fn runtime_version_check_can_be_disabled() {
    let journal = Journal::default();
    let read_only = foundation(FakeFactory {
        journal: Arc::clone(&journal),
        ..FakeFactory::default()
    });
    let mut config = config(&["relay"]);
    config.disable_runtime_version_check = true;

    read_only.start(config).await.unwrap();

    assert_eq!(events(&journal), ["connect relay"]);
    read_only.stop().await.unwrap();
}

#[tokio::test]
async fn health_check_targets_the_matching_provider() {
    let journal = Journal::default();
    let read_only = foundation(FakeFactory {
        greet_failing: vec!["relay"],
        journal: Arc::clone(&journal),
        ..FakeFactory::default()
    });
    let mut config = config(&["relay", "para"]);
    config.disable_runtime_version_check = true;
    read_only.start(config).await.unwrap();

    read_only
        .health_check(Some("ws://localhost:9945"))
        .await
        .unwrap();

    let first = read_only.health_check(None).await.unwrap_err();
    assert!(matches!(first.reason(), HealthCheckReason::Probe(_)));

    let unknown = read_only
        .health_check(Some("ws://localhost:1"))
        .await
        .unwrap_err();
    assert!(matches!(unknown.reason(), HealthCheckReason::UnknownEndpoint(_)));

    read_only.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn health_check_deadline_is_reported_as_a_health_check_failure() {
    let read_only = foundation(FakeFactory {
        greet_stalling: vec!["relay"],
        ..FakeFactory::default()
    });
    let mut config = config(&["relay"]);
    config.disable_runtime_version_check = true;
    read_only.start(config).await.unwrap();

    let error = read_only.health_check(None).await.unwrap_err();

    let HealthCheckReason::Timeout(timeout) = error.reason() else {
        panic!("unexpected reason: {error}");
    };
    assert_eq!(timeout.timeout_ms(), 30_000);
    assert!(error.to_string().contains("timed out after 30s"), "{error}");
    assert!(read_only.status().is_active());
    read_only.stop().await.unwrap();
}

#[tokio::test]
async fn health_check_requires_a_connection() {
    let read_only = foundation(FakeFactory::default());

    let error = read_only.health_check(None).await.unwrap_err();

    assert!(matches!(error.reason(), HealthCheckReason::NotRunning { .. }));
}
