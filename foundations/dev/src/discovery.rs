//! Finding the RPC port a freshly launched node is listening on.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moonwall_foundation_core::{
    DiscoveryError, DynError,
    policy::RetryPolicy,
    readiness::{ReadinessProbe, local_ws_endpoint},
};
use tokio::process::Command;
use tracing::{debug, info};

/// Default p2p and prometheus ports; never the RPC port.
pub const EXCLUDED_PORTS: [u16; 2] = [30333, 9615];

/// Lists the TCP ports a process is listening on.
#[async_trait]
pub trait PortSource: Send + Sync {
    async fn listening_ports(&self, pid: u32) -> Result<Vec<u16>, DynError>;
}

/// Reads listening sockets through `lsof`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LsofPortSource;

#[async_trait]
impl PortSource for LsofPortSource {
    async fn listening_ports(&self, pid: u32) -> Result<Vec<u16>, DynError> {
        let output = Command::new("lsof")
            .args(["-a", "-n", "-P", "-iTCP", "-sTCP:LISTEN", "-p"])
            .arg(pid.to_string())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // lsof exits non-zero when nothing matched yet.
        if !output.status.success() && stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(parse_listening_ports(&stdout))
    }
}

/// Extracts listening ports from `lsof` output, in order of appearance.
#[must_use]
pub fn parse_listening_ports(output: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in output.lines().filter(|line| line.contains("(LISTEN)")) {
        let Some(address) = line
            .split_whitespace()
            .take_while(|token| *token != "(LISTEN)")
            .last()
        else {
            continue;
        };
        let Some(port) = address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        else {
            continue;
        };
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

pub struct PortDiscovery {
    source: Arc<dyn PortSource>,
    probe: Option<Arc<dyn ReadinessProbe>>,
    policy: RetryPolicy,
}

impl Default for PortDiscovery {
    fn default() -> Self {
        Self::new(Arc::new(LsofPortSource))
    }
}

impl PortDiscovery {
    #[must_use]
    pub fn new(source: Arc<dyn PortSource>) -> Self {
        Self {
            source,
            probe: None,
            policy: RetryPolicy::port_discovery(),
        }
    }

    /// Disambiguates processes listening on several candidate ports.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub(crate) fn or_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        if self.probe.is_none() {
            self.probe = Some(probe);
        }
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.policy = RetryPolicy::fixed(max_attempts, interval);
        self
    }

    pub async fn discover(&self, pid: u32, is_ethereum_chain: bool) -> Result<u16, DiscoveryError> {
        let mut attempts = 0;
        let outcome = self
            .policy
            .retry(|attempt| {
                attempts = attempt;
                self.discover_once(pid, is_ethereum_chain)
            })
            .await;

        match outcome {
            Ok(port) => {
                info!(pid, port, attempts, "discovered RPC port");
                Ok(port)
            }
            Err(source) => Err(DiscoveryError::new(pid, attempts, Some(source))),
        }
    }

    async fn discover_once(&self, pid: u32, is_ethereum_chain: bool) -> Result<u16, DynError> {
        let candidates: Vec<u16> = self
            .source
            .listening_ports(pid)
            .await?
            .into_iter()
            .filter(|port| !EXCLUDED_PORTS.contains(port))
            .collect();

        match (candidates.as_slice(), &self.probe) {
            ([], _) => Err(format!("pid {pid} is not listening on an RPC port yet").into()),
            ([port], _) | ([port, ..], None) => Ok(*port),
            (ports, Some(probe)) => {
                for port in ports {
                    let endpoint = local_ws_endpoint(*port);
                    match probe.probe(&endpoint, is_ethereum_chain).await {
                        Ok(true) => return Ok(*port),
                        Ok(false) => debug!(pid, port, "candidate port not ready"),
                        Err(error) => debug!(pid, port, %error, "candidate port unreachable"),
                    }
                }
                Err(format!("none of ports {ports:?} answered for pid {pid}").into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const LSOF_OUTPUT: &str = "\
COMMAND    PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
moonbeam 4242 dev   20u  IPv4 0x1234      0t0  TCP *:30333 (LISTEN)
moonbeam 4242 dev   21u  IPv6 0x1235      0t0  TCP [::1]:9944 (LISTEN)
moonbeam 4242 dev   22u  IPv4 0x1236      0t0  TCP 127.0.0.1:9944 (LISTEN)
moonbeam 4242 dev   23u  IPv4 0x1237      0t0  TCP 127.0.0.1:9615 (LISTEN)
";

    #[test]
    fn parses_lsof_listing() {
        assert_eq!(parse_listening_ports(LSOF_OUTPUT), vec![30333, 9944, 9615]);
        assert!(parse_listening_ports("").is_empty());
    }

    struct ScriptedPorts(Mutex<Vec<Vec<u16>>>);

    #[async_trait]
    impl PortSource for ScriptedPorts {
        async fn listening_ports(&self, _: u32) -> Result<Vec<u16>, DynError> {
            let mut script = self.0.lock().unwrap();
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script.first().cloned().unwrap_or_default())
            }
        }
    }

    struct OnlyReady(u16);

    #[async_trait]
    impl ReadinessProbe for OnlyReady {
        async fn probe(&self, endpoint: &str, _: bool) -> Result<bool, DynError> {
            Ok(endpoint.ends_with(&format!(":{}", self.0)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_port_to_appear() {
        let source = ScriptedPorts(Mutex::new(vec![vec![], vec![30333], vec![30333, 9944]]));
        let discovery = PortDiscovery::new(Arc::new(source));

        assert_eq!(discovery.discover(4242, false).await.unwrap(), 9944);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_picks_between_candidates() {
        let source = ScriptedPorts(Mutex::new(vec![vec![9933, 9944]]));
        let discovery = PortDiscovery::new(Arc::new(source)).with_probe(Arc::new(OnlyReady(9944)));

        assert_eq!(discovery.discover(4242, true).await.unwrap(), 9944);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts() {
        let source = ScriptedPorts(Mutex::new(vec![vec![30333, 9615]]));
        let discovery =
            PortDiscovery::new(Arc::new(source)).with_max_attempts(5, Duration::from_millis(200));

        let error = discovery.discover(4242, false).await.unwrap_err();

        assert_eq!(error.pid(), 4242);
        assert_eq!(error.attempts(), 5);
    }
}
