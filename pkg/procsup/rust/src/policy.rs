// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! A descriptor split into the policies each control loop consumes.

use crate::crashloop::CrashLoopTracker;
use crate::descriptor::{ExecMode, HealthCheckConfig, LogPaths, ProcessDescriptor};
use crate::timefmt::TimestampFormat;
use log::warn;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LaunchPolicy {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Overlaid on the supervisor's own environment.
    pub env: BTreeMap<String, String>,
    pub instances: u32,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub auto_restart: bool,
    pub min_uptime: Duration,
    pub max_restarts: u32,
    pub delay: Duration,
}

impl RestartPolicy {
    pub fn tracker(&self) -> CrashLoopTracker {
        CrashLoopTracker::new(self.min_uptime, self.max_restarts)
    }
}

#[derive(Debug, Clone)]
pub struct LogPolicy {
    pub paths: LogPaths,
    pub timestamp: TimestampFormat,
}

#[derive(Debug, Clone)]
pub struct WatchPolicy {
    pub root: PathBuf,
    /// Written by the process itself; changes there never trigger restarts.
    pub ignored: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Policies {
    pub launch: LaunchPolicy,
    pub restart: RestartPolicy,
    pub kill_timeout: Duration,
    /// Present when the child must signal readiness within this long.
    pub listen_timeout: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub health: Option<HealthCheckConfig>,
    pub logs: LogPolicy,
    pub watch: Option<WatchPolicy>,
}

impl From<&ProcessDescriptor> for Policies {
    fn from(d: &ProcessDescriptor) -> Self {
        let requested = d.instance_count.resolve();
        let instances = match d.execution_mode {
            ExecMode::Cluster => requested,
            ExecMode::Fork => {
                if requested > 1 {
                    warn!(
                        "[{}] instances={requested} ignored in fork mode, running a single process",
                        d.name
                    );
                }
                1
            }
        };

        let watch = d.watch_filesystem.then(|| WatchPolicy {
            root: d.working_directory.clone(),
            ignored: [&d.log_paths.combined, &d.log_paths.out, &d.log_paths.error]
                .into_iter()
                .filter_map(|p| p.parent().map(PathBuf::from))
                .collect(),
        });

        Policies {
            launch: LaunchPolicy {
                command: d.command.clone(),
                args: d.arguments.clone(),
                working_dir: d.working_directory.clone(),
                env: d.environment.clone(),
                instances,
            },
            restart: RestartPolicy {
                auto_restart: d.auto_restart,
                min_uptime: d.min_uptime,
                max_restarts: d.max_restart_attempts,
                delay: d.restart_delay,
            },
            kill_timeout: d.kill_timeout,
            listen_timeout: d.wait_for_ready_signal.then_some(d.listen_timeout),
            memory_limit: d.max_memory_bytes,
            health: d.health_check.clone(),
            logs: LogPolicy {
                paths: d.log_paths.clone(),
                timestamp: TimestampFormat::parse(&d.log_timestamp_format),
            },
            watch,
        }
    }
}
