// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::LaunchError;
use crate::logs::{self, LogSinks, Stream};
use crate::policy::{LaunchPolicy, LogPolicy};
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout, timeout_at};

/// Bound on waiting for the kernel to reap a SIGKILLed child.
pub(crate) const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on flushing buffered output after the child exits, shared by both
/// streams. Processes that left the group can keep the pipes open forever.
pub(crate) const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum StopOutcome {
    /// Exited within the kill timeout.
    Exited(ExitStatus),
    /// Needed SIGKILL.
    Killed,
    AlreadyStopped,
}

/// One OS process, the process group it leads, and its log forwarders.
pub struct ManagedProcess {
    label: String,
    child: Option<Child>,
    /// Set from spawn until the group is known to be empty or has been
    /// killed, so it can outlive the leader.
    group: Option<Pid>,
    started_at: Option<Instant>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    pub fn new(label: String) -> Self {
        Self {
            label,
            child: None,
            group: None,
            started_at: None,
            forwarders: Vec::new(),
        }
    }

    /// Spawn the child as the leader of a new process group, with stdin
    /// closed and both output streams forwarded to the log files.
    /// `extra_env` is applied after the policy env.
    pub fn spawn(
        &mut self,
        launch: &LaunchPolicy,
        logs: &LogPolicy,
        extra_env: &[(String, String)],
    ) -> Result<u32, LaunchError> {
        if !launch.working_dir.is_dir() {
            return Err(LaunchError::MissingWorkingDirectory(launch.working_dir.clone()));
        }
        let sinks = Arc::new(LogSinks::open(logs)?);

        let program = resolve_program(&launch.command, &launch.working_dir);
        let mut cmd = Command::new(&program);
        cmd.args(&launch.args)
            .current_dir(&launch.working_dir)
            .envs(&launch.env)
            .envs(extra_env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn(&launch.command, e))?;

        let pid = child.id().unwrap_or(0);
        info!(
            "[{}] spawned (pid={}, cmd={})",
            self.label,
            pid,
            program.display()
        );

        if let Some(out) = child.stdout.take() {
            self.forwarders
                .push(logs::forward(out, Stream::Stdout, Arc::clone(&sinks)));
        }
        if let Some(err) = child.stderr.take() {
            self.forwarders.push(logs::forward(err, Stream::Stderr, sinks));
        }
        self.child = Some(child);
        self.group = (pid != 0).then(|| Pid::from_raw(pid as i32));
        self.started_at = Some(Instant::now());
        Ok(pid)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Signal every process in the child's group.
    pub fn send_signal(&self, sig: Signal) {
        if let Some(group) = self.group
            && let Err(e) = signal::killpg(group, sig)
        {
            warn!("[{}] failed to send {sig}: {e}", self.label);
        }
    }

    /// Wait for the child to exit and its output to be flushed. Pending
    /// forever when nothing is running, so it can sit in a `select!` next to
    /// other events.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.wait_exit().await;
        self.kill_leftovers();
        self.drain_logs().await;
        status
    }

    async fn wait_exit(&mut self) -> std::io::Result<ExitStatus> {
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let status = child.wait().await;
        self.child = None;
        if let Ok(status) = &status {
            info!("[{}] exited with {status}", self.label);
        }
        status
    }

    /// SIGTERM to the group, then exactly one SIGKILL if the child outlives
    /// `kill_timeout`. Whatever is left in the group after the child exits
    /// is killed before the output is drained.
    pub async fn stop(&mut self, kill_timeout: Duration) -> StopOutcome {
        if !self.is_running() {
            return StopOutcome::AlreadyStopped;
        }
        info!("[{}] sending SIGTERM", self.label);
        self.send_signal(Signal::SIGTERM);

        let outcome = match timeout(kill_timeout, self.wait_exit()).await {
            Ok(Ok(status)) => StopOutcome::Exited(status),
            Ok(Err(e)) => {
                warn!("[{}] wait failed: {e}", self.label);
                StopOutcome::AlreadyStopped
            }
            Err(_) => {
                warn!(
                    "[{}] kill timeout ({}ms) reached, sending SIGKILL",
                    self.label,
                    kill_timeout.as_millis()
                );
                self.send_signal(Signal::SIGKILL);
                if timeout(SIGKILL_TIMEOUT, self.wait_exit()).await.is_err() {
                    warn!("[{}] still running after SIGKILL, giving up", self.label);
                    self.child = None;
                }
                StopOutcome::Killed
            }
        };
        self.kill_leftovers();
        self.drain_logs().await;
        outcome
    }

    /// SIGKILL the rest of the group once its leader is gone.
    fn kill_leftovers(&mut self) {
        let Some(group) = self.group.take() else {
            return;
        };
        if signal::killpg(group, None).is_ok() {
            info!("[{}] killing processes left in group {group}", self.label);
            if let Err(e) = signal::killpg(group, Signal::SIGKILL) {
                warn!("[{}] failed to kill group {group}: {e}", self.label);
            }
        }
    }

    async fn drain_logs(&mut self) {
        let deadline = Instant::now() + LOG_DRAIN_TIMEOUT;
        for mut handle in self.forwarders.drain(..) {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("[{}] log pipe still open after exit", self.label);
                handle.abort();
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // kill_on_drop only reaches the leader.
        if let Some(group) = self.group {
            let _ = signal::killpg(group, Signal::SIGKILL);
        }
    }
}

/// Relative paths with a separator run from the working directory; bare
/// names are looked up on `PATH`.
fn resolve_program(command: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        working_dir.join(path)
    } else {
        path.to_path_buf()
    }
}
