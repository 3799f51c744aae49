use std::fmt;

/// Observable state of a foundation.
///
/// Process-backed foundations move through `Stopped → Starting → Running`;
/// connection-backed ones through `Disconnected → Connecting → Connected`.
/// Any of them may land in `Failed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FoundationStatus {
    Stopped,
    Starting,
    Running { endpoint: String, pid: Option<u32> },
    Disconnected,
    Connecting,
    Connected { count: usize, endpoints: Vec<String> },
    Failed { error: String },
}

impl FoundationStatus {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running { .. } | Self::Connected { .. })
    }

    /// Active, or on its way there.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Starting | Self::Connecting) || self.is_active()
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Running { endpoint, .. } => Some(endpoint),
            Self::Connected { endpoints, .. } => endpoints.first().map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for FoundationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { endpoint, pid: Some(pid) } => {
                write!(f, "running at {endpoint} (pid {pid})")
            }
            Self::Running { endpoint, pid: None } => write!(f, "running at {endpoint}"),
            Self::Connected { count, .. } => write!(f, "connected ({count} providers)"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            other => f.write_str(other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_covers_transitional_and_active_states() {
        let running = FoundationStatus::Running {
            endpoint: "ws://localhost:9944".to_owned(),
            pid: Some(42),
        };
        assert!(running.is_active());
        assert!(FoundationStatus::Starting.is_busy());
        assert!(!FoundationStatus::Starting.is_active());
        assert!(!FoundationStatus::Failed { error: "x".into() }.is_busy());
        assert_eq!(running.endpoint(), Some("ws://localhost:9944"));
        assert_eq!(running.to_string(), "running at ws://localhost:9944 (pid 42)");
    }
}
