// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not running, either never started or stopped on request.
    Stopped,
    /// Spawned, waiting for the readiness signal when one is required.
    Starting,
    /// Did not become ready (spawn error, early exit, readiness timeout).
    FailedStart,
    /// Alive and eligible for traffic.
    Running,
    /// Termination requested, waiting for the child to exit.
    Stopping,
    /// Exited without being asked to, or was killed by a restart policy.
    Crashed,
    /// Waiting out `restart_delay` before the next start.
    Restarting,
    /// Crash loop limit reached. Cleared only by an explicit reset.
    TerminalFailure,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }

    /// States the control loop sits in until it receives a command.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped
                | ProcessState::FailedStart
                | ProcessState::Crashed
                | ProcessState::TerminalFailure
        )
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, FailedStart)
                | (Starting, Stopping)
                | (FailedStart, Restarting)
                | (FailedStart, TerminalFailure)
                | (FailedStart, Starting)
                | (FailedStart, Stopped)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Stopping, Crashed)
                | (Stopping, FailedStart)
                | (Crashed, Restarting)
                | (Crashed, TerminalFailure)
                | (Crashed, Starting)
                | (Crashed, Stopped)
                | (Restarting, Starting)
                | (Restarting, Stopped)
                | (TerminalFailure, Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::FailedStart => write!(f, "failed-start"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::TerminalFailure => write!(f, "terminal-failure"),
        }
    }
}
