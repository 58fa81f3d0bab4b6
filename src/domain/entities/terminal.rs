//! Terminal lifecycle state machine.
//!
//! One terminal per trading account. Transitions are driven by lifecycle
//! orchestration (provision/teardown) and by heartbeats, which promote any
//! non-RUNNING terminal back to RUNNING once contact resumes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Pending => "PENDING",
            TerminalStatus::Starting => "STARTING",
            TerminalStatus::Running => "RUNNING",
            TerminalStatus::Stopping => "STOPPING",
            TerminalStatus::Stopped => "STOPPED",
            TerminalStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TerminalStatus::Pending),
            "STARTING" => Some(TerminalStatus::Starting),
            "RUNNING" => Some(TerminalStatus::Running),
            "STOPPING" => Some(TerminalStatus::Stopping),
            "STOPPED" => Some(TerminalStatus::Stopped),
            "ERROR" => Some(TerminalStatus::Error),
            _ => None,
        }
    }

    /// Whether moving to `next` is a legal lifecycle transition.
    ///
    /// RUNNING is reachable from every other state: the orchestrator reports
    /// a successful start, or a heartbeat proves the process is alive
    /// regardless of what we last recorded (self-healing from ERROR).
    pub fn can_transition(self, next: TerminalStatus) -> bool {
        use TerminalStatus::*;
        if self == next {
            return false;
        }
        match next {
            Starting => self == Pending,
            Running => true,
            Stopping => matches!(self, Pending | Starting | Running | Error),
            Stopped => self == Stopping,
            Error => matches!(self, Starting | Running | Stopping),
            Pending => matches!(self, Stopped | Error),
        }
    }

    /// States in which the external orchestrator should keep a container up.
    pub fn wants_container(self) -> bool {
        matches!(
            self,
            TerminalStatus::Pending | TerminalStatus::Starting | TerminalStatus::Running
        )
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
