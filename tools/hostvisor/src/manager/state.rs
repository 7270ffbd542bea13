// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::ports::ServiceEndpoints;
use semver::Version;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Updating,
}

impl Display for SupervisorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Restarting => write!(f, "restarting"),
            SupervisorState::Updating => write!(f, "updating"),
        }
    }
}

/// Where the running backend binary came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BinarySource {
    /// The binary shipped with the host. No update has been activated.
    Bundled,

    /// An update-managed version.
    Updated,

    /// The bundled (or a previous) binary, because `rejected` was invalidated.
    RolledBack { rejected: Version },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    HealthCheckFailed,
    ProcessExited,
    PreferenceChanged,
    RestartRequested,
    Update,
    LaunchRetry,
    Operator,
}

impl Display for RestartReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::HealthCheckFailed => write!(f, "the health check failed"),
            RestartReason::ProcessExited => write!(f, "the process has exited"),
            RestartReason::PreferenceChanged => write!(f, "the configuration has changed"),
            RestartReason::RestartRequested => write!(f, "a restart was requested"),
            RestartReason::Update => write!(f, "a new version was installed"),
            RestartReason::LaunchRetry => write!(f, "retrying a failed launch"),
            RestartReason::Operator => write!(f, "operator request"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: SupervisorState,
    pub endpoints: Option<ServiceEndpoints>,
    pub pid: Option<u32>,
    pub backend_version: Option<Version>,
    pub binary_source: BinarySource,
    pub consecutive_startup_failures: u32,

    /// Number of successful launches since the supervisor was created.
    pub launches: u64,
    pub allow_remote_in_mcp: bool,

    /// Set if the last start was skipped because another supervisor owns the backend.
    pub deferred: bool,
}

impl StatusReport {
    pub(crate) fn initial(allow_remote_in_mcp: bool) -> Self {
        StatusReport {
            state: SupervisorState::Stopped,
            endpoints: None,
            pid: None,
            backend_version: None,
            binary_source: BinarySource::Bundled,
            consecutive_startup_failures: 0,
            launches: 0,
            allow_remote_in_mcp,
            deferred: false,
        }
    }
}

/// Counts consecutive exits that happened shortly after a launch.
#[derive(Debug, Clone)]
pub struct CrashCounter {
    grace_period: Duration,
    threshold: u32,
    consecutive: u32,
}

impl CrashCounter {
    pub fn new(grace_period: Duration, threshold: u32) -> Self {
        CrashCounter {
            grace_period,
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Records an exit of a process that ran for `uptime`.
    /// Returns `true` once the threshold is reached, in which case the counter starts over.
    pub fn record_exit(&mut self, uptime: Duration) -> bool {
        if uptime >= self.grace_period {
            self.consecutive = 0;
            return false;
        }

        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            return true;
        }
        false
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_counter_triggers_at_threshold() {
        let mut counter = CrashCounter::new(Duration::from_secs(30), 3);
        assert!(!counter.record_exit(Duration::from_secs(1)));
        assert!(!counter.record_exit(Duration::from_secs(2)));
        assert_eq!(counter.consecutive(), 2);
        assert!(counter.record_exit(Duration::from_secs(3)));
        assert_eq!(counter.consecutive(), 0);
    }

    #[test]
    fn late_exit_resets_the_counter() {
        let mut counter = CrashCounter::new(Duration::from_secs(30), 3);
        assert!(!counter.record_exit(Duration::from_secs(1)));
        assert!(!counter.record_exit(Duration::from_secs(1)));
        assert!(!counter.record_exit(Duration::from_secs(31)));
        assert_eq!(counter.consecutive(), 0);
        assert!(!counter.record_exit(Duration::from_secs(1)));
        assert!(!counter.record_exit(Duration::from_secs(1)));
        assert!(counter.record_exit(Duration::from_secs(1)));
    }

    #[test]
    fn binary_source_serialisation() -> anyhow::Result<()> {
        let source = BinarySource::RolledBack {
            rejected: Version::new(2, 0, 0),
        };
        assert_eq!(
            serde_json::to_value(source)?,
            serde_json::json!({ "kind": "rolled_back", "rejected": "2.0.0" })
        );
        assert_eq!(
            serde_json::to_value(BinarySource::Bundled)?,
            serde_json::json!({ "kind": "bundled" })
        );
        Ok(())
    }
}
