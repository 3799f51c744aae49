//! Polling an RPC endpoint until the node behind it answers.

use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::{
    core::{ClientError, client::ClientT as _},
    rpc_params,
    ws_client::WsClientBuilder,
};
use tokio::time::sleep;
use tracing::debug;

use crate::{DynError, policy::defaults};

/// Attempt budget used by health checks.
pub const HEALTH_CHECK_ATTEMPTS: u32 = 10;

#[must_use]
pub fn local_ws_endpoint(port: u16) -> String {
    format!("ws://localhost:{port}")
}

/// Asks a node whether it is ready.
///
/// `Ok(false)` means the node answered but is not serving yet; `Err` means it
/// could not be reached at all.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &str, is_ethereum_chain: bool) -> Result<bool, DynError>;
}

/// Probes over a websocket JSON-RPC connection with a trivial method call:
/// `eth_chainId` for Ethereum-compatible chains, `system_chain` otherwise.
#[derive(Clone, Debug)]
pub struct JsonRpcProbe {
    request_timeout: Duration,
}

impl Default for JsonRpcProbe {
    fn default() -> Self {
        Self {
            request_timeout: defaults::RPC_CALL,
        }
    }
}

impl JsonRpcProbe {
    #[must_use]
    pub const fn with_request_timeout(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl ReadinessProbe for JsonRpcProbe {
    async fn probe(&self, endpoint: &str, is_ethereum_chain: bool) -> Result<bool, DynError> {
        let client = WsClientBuilder::default()
            .connection_timeout(self.request_timeout)
            .request_timeout(self.request_timeout)
            .build(endpoint)
            .await?;

        let method = if is_ethereum_chain {
            "eth_chainId"
        } else {
            "system_chain"
        };
        match client.request::<serde_json::Value, _>(method, rpc_params![]).await {
            Ok(_) => Ok(true),
            Err(ClientError::Call(error)) => {
                debug!(%endpoint, method, %error, "node answered with an error");
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessCheck {
    max_attempts: u32,
    interval: Duration,
}

impl ReadinessCheck {
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            interval,
        }
    }

    #[must_use]
    pub const fn health_check() -> Self {
        Self::new(HEALTH_CHECK_ATTEMPTS, Duration::from_millis(100))
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self::new(600, Duration::from_millis(200))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{endpoint} unreachable after {attempts} readiness attempts: {source}")]
pub struct ReadinessError {
    endpoint: String,
    attempts: u32,
    #[source]
    source: DynError,
}

impl ReadinessError {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Probes `endpoint` up to `check.max_attempts` times.
///
/// Returns `Ok(true)` as soon as a probe succeeds and `Ok(false)` when the
/// budget runs out with the node still reporting not-ready. If the final
/// attempt failed to reach the node at all, that failure is returned.
pub async fn check_ready(
    probe: &dyn ReadinessProbe,
    endpoint: &str,
    is_ethereum_chain: bool,
    check: ReadinessCheck,
) -> Result<bool, ReadinessError> {
    let mut last_failure = None;
    for attempt in 1..=check.max_attempts {
        match probe.probe(endpoint, is_ethereum_chain).await {
            Ok(true) => {
                debug!(%endpoint, attempt, "endpoint ready");
                return Ok(true);
            }
            Ok(false) => last_failure = None,
            Err(error) => {
                debug!(%endpoint, attempt, %error, "readiness probe failed");
                last_failure = Some(error);
            }
        }
        if attempt < check.max_attempts {
            sleep(check.interval).await;
        }
    }

    last_failure.map_or(Ok(false), |source| {
        Err(ReadinessError {
            endpoint: endpoint.to_owned(),
            attempts: check.max_attempts,
            source,
        })
    })
}
