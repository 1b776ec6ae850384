// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    GiveUp,
}

/// Counts consecutive runs shorter than `min_uptime`. A run that lasts at
/// least `min_uptime` resets the count; reaching `max_restarts` gives up.
#[derive(Debug, Clone)]
pub struct CrashLoopTracker {
    min_uptime: Duration,
    max_restarts: u32,
    unstable_restarts: u32,
}

impl CrashLoopTracker {
    pub fn new(min_uptime: Duration, max_restarts: u32) -> Self {
        Self {
            min_uptime,
            max_restarts,
            unstable_restarts: 0,
        }
    }

    pub fn min_uptime(&self) -> Duration {
        self.min_uptime
    }

    pub fn unstable_restarts(&self) -> u32 {
        self.unstable_restarts
    }

    pub fn record_exit(&mut self, uptime: Duration) -> RestartDecision {
        if uptime >= self.min_uptime {
            self.unstable_restarts = 0;
            return RestartDecision::Restart;
        }
        self.unstable_restarts = self.unstable_restarts.saturating_add(1);
        if self.unstable_restarts >= self.max_restarts {
            RestartDecision::GiveUp
        } else {
            RestartDecision::Restart
        }
    }

    /// Called once the current run has lasted `min_uptime`.
    /// Returns true if the counter was non-zero.
    pub fn mark_stable(&mut self) -> bool {
        std::mem::take(&mut self.unstable_restarts) > 0
    }

    pub fn reset(&mut self) {
        self.unstable_restarts = 0;
    }
}
