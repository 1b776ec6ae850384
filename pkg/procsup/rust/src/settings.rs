// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Supervisor-wide settings, as opposed to per-process descriptors.

use log::warn;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_RUNTIME_DIR: &str = "DD_PROCSUP_RUNTIME_DIR";
pub const ENV_MEMORY_POLL_MS: &str = "DD_PROCSUP_MEMORY_POLL_MS";
pub const ENV_WATCH_POLL_MS: &str = "DD_PROCSUP_WATCH_POLL_MS";

const DEFAULT_MEMORY_POLL: Duration = Duration::from_secs(1);
const DEFAULT_WATCH_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Settings {
    /// Holds the readiness sockets.
    pub runtime_dir: PathBuf,
    pub memory_poll_interval: Duration,
    pub watch_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_dir: env::temp_dir().join("dd-procsup"),
            memory_poll_interval: DEFAULT_MEMORY_POLL,
            watch_poll_interval: DEFAULT_WATCH_POLL,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| match lookup(key) {
            None => default,
            Some(v) => match v.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    warn!("ignoring {key}={v:?}: expected a positive number of milliseconds");
                    default
                }
            },
        };
        Self {
            runtime_dir: lookup(ENV_RUNTIME_DIR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.runtime_dir),
            memory_poll_interval: millis(ENV_MEMORY_POLL_MS, defaults.memory_poll_interval),
            watch_poll_interval: millis(ENV_WATCH_POLL_MS, defaults.watch_poll_interval),
        }
    }
}
