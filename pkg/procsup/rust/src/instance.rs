// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The control loop of one process instance. The loop owns the child and
//! its state; everything else talks to it through [`InstanceHandle`].

use crate::crashloop::{CrashLoopTracker, RestartDecision};
use crate::error::{LaunchError, SupervisorError};
use crate::health::{self, HttpProbe};
use crate::memory;
use crate::policy::Policies;
use crate::process::ManagedProcess;
use crate::readiness::{NOTIFY_SOCKET_ENV, ReadyListener};
use crate::settings::Settings;
use crate::state::ProcessState;
use crate::units::format_bytes;
use crate::watch as fswatch;
use log::{error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const ENV_APP_NAME: &str = "PROCSUP_APP_NAME";
pub const ENV_INSTANCE_ID: &str = "PROCSUP_INSTANCE_ID";

/// Why a running instance must be restarted although it did not exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartTrigger {
    Unhealthy { failures: u32 },
    MemoryExceeded { rss: u64, limit: u64 },
    FilesChanged(PathBuf),
}

impl RestartTrigger {
    /// Watch restarts are requested by the operator's edits, not by a
    /// misbehaving process, so they never count towards the crash loop.
    pub fn counts_as_crash(&self) -> bool {
        !matches!(self, RestartTrigger::FilesChanged(_))
    }
}

impl fmt::Display for RestartTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartTrigger::Unhealthy { failures } => {
                write!(f, "{failures} consecutive failed health checks")
            }
            RestartTrigger::MemoryExceeded { rss, limit } => write!(
                f,
                "memory {} over limit {}",
                format_bytes(*rss),
                format_bytes(*limit)
            ),
            RestartTrigger::FilesChanged(path) => write!(f, "file changed: {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// Restarts performed by the supervisor since launch.
    pub restarts: u32,
    /// Current length of the run of short-lived starts.
    pub unstable_restarts: u32,
    pub last_error: Option<String>,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            restarts: 0,
            unstable_restarts: 0,
            last_error: None,
        }
    }
}

enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Reset,
}

pub struct InstanceHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<InstanceStatus>,
    task: JoinHandle<()>,
}

impl InstanceHandle {
    /// Spawn the control loop and start the instance.
    pub fn spawn(app: &str, id: u32, policies: Arc<Policies>, settings: Arc<Settings>) -> Self {
        let label = format!("{app}:{id}");
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(InstanceStatus::default());

        let instance = Instance {
            label: label.clone(),
            app: app.to_string(),
            id,
            tracker: policies.restart.tracker(),
            policies,
            settings,
            process: ManagedProcess::new(label.clone()),
            state: ProcessState::Stopped,
            restarts: 0,
            last_error: None,
            status: status_tx,
            commands: command_rx,
            stop_waiters: Vec::new(),
        };
        let _ = commands.send(Command::Start);
        let task = tokio::spawn(instance.run());

        Self {
            commands,
            status,
            task,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceStatus> {
        self.status.clone()
    }

    /// Start a stopped, crashed or failed instance. Ignored while running
    /// and in terminal failure.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Clear the crash counter and terminal failure, then start.
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    /// Ask for a graceful stop. The receiver completes once the instance is
    /// stopped, or errors if the control loop is gone.
    pub fn request_stop(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Stop(done));
        rx
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        // The child is killed when the loop's ManagedProcess is dropped.
        self.task.abort();
    }
}

/// Background monitors of one run, aborted when the run ends.
struct MonitorSet(Vec<JoinHandle<()>>);

impl Drop for MonitorSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

struct Instance {
    label: String,
    app: String,
    id: u32,
    policies: Arc<Policies>,
    settings: Arc<Settings>,
    process: ManagedProcess,
    tracker: CrashLoopTracker,
    state: ProcessState,
    restarts: u32,
    last_error: Option<String>,
    status: watch::Sender<InstanceStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl Instance {
    async fn run(mut self) {
        loop {
            match self.state {
                ProcessState::Starting => self.start().await,
                ProcessState::Running => self.supervise().await,
                ProcessState::Restarting => self.restart_after_delay().await,
                _ => {
                    if !self.rest().await {
                        return;
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: ProcessState) {
        if !self.state.can_transition_to(next) {
            warn!("[{}] unexpected transition {} -> {next}", self.label, self.state);
        }
        info!("[{}] {} -> {next}", self.label, self.state);
        self.state = next;
        if next == ProcessState::Stopped {
            for done in self.stop_waiters.drain(..) {
                let _ = done.send(());
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(InstanceStatus {
            state: self.state,
            pid: self.process.pid(),
            restarts: self.restarts,
            unstable_restarts: self.tracker.unstable_restarts(),
            last_error: self.last_error.clone(),
        });
    }

    /// Wait for a command in a resting state. Returns false once every
    /// handle is gone.
    async fn rest(&mut self) -> bool {
        let Some(cmd) = self.commands.recv().await else {
            return false;
        };
        match cmd {
            Command::Start if self.state == ProcessState::TerminalFailure => {
                warn!("[{}] in terminal failure, reset required", self.label);
            }
            Command::Start => {
                self.tracker.reset();
                self.transition(ProcessState::Starting);
            }
            Command::Stop(done) => {
                match self.state {
                    ProcessState::Crashed | ProcessState::FailedStart => {
                        self.transition(ProcessState::Stopped)
                    }
                    // Stopping does not clear a terminal failure.
                    _ => {}
                }
                let _ = done.send(());
            }
            Command::Reset => {
                self.tracker.reset();
                self.last_error = None;
                if self.state == ProcessState::TerminalFailure {
                    info!("[{}] terminal failure cleared", self.label);
                    self.transition(ProcessState::Stopped);
                }
                self.transition(ProcessState::Starting);
            }
        }
        true
    }

    async fn start(&mut self) {
        let listener = match self.policies.listen_timeout {
            None => None,
            Some(_) => match ReadyListener::bind(&self.settings.runtime_dir, &self.label) {
                Ok(listener) => Some(listener),
                Err(e) => return self.launch_failed(LaunchError::Readiness(e)),
            },
        };

        let mut env = vec![
            (ENV_APP_NAME.to_string(), self.app.clone()),
            (ENV_INSTANCE_ID.to_string(), self.id.to_string()),
        ];
        if let Some(listener) = &listener {
            env.push((
                NOTIFY_SOCKET_ENV.to_string(),
                listener.path().display().to_string(),
            ));
        }
        let policies = Arc::clone(&self.policies);
        if let Err(e) = self.process.spawn(&policies.launch, &policies.logs, &env) {
            return self.launch_failed(e);
        }
        self.publish();

        let (Some(listener), Some(limit)) = (listener, policies.listen_timeout) else {
            self.transition(ProcessState::Running);
            return;
        };

        let ready = listener.wait_ready(limit);
        tokio::pin!(ready);
        loop {
            tokio::select! {
                ready = &mut ready => {
                    if ready {
                        info!("[{}] ready", self.label);
                        self.transition(ProcessState::Running);
                    } else {
                        let reason = format!("no readiness signal within {}ms", limit.as_millis());
                        warn!("[{}] {reason}, stopping", self.label);
                        self.last_error = Some(reason);
                        self.transition(ProcessState::Stopping);
                        self.process.stop(policies.kill_timeout).await;
                        self.after_exit(ProcessState::FailedStart, Duration::ZERO, None);
                    }
                    return;
                }
                status = self.process.wait() => {
                    let reason = match status {
                        Ok(status) => format!("exited with {status} before becoming ready"),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    warn!("[{}] {reason}", self.label);
                    self.last_error = Some(reason);
                    return self.after_exit(ProcessState::FailedStart, Duration::ZERO, None);
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Stop(done)) => {
                        self.stop_waiters.push(done);
                        return self.stop_now().await;
                    }
                    None => return self.stop_now().await,
                    Some(Command::Reset) => self.tracker.reset(),
                    Some(Command::Start) => {}
                },
            }
        }
    }

    fn launch_failed(&mut self, e: LaunchError) {
        error!("[{}] failed to start: {e}", self.label);
        self.last_error = Some(e.to_string());
        self.after_exit(ProcessState::FailedStart, Duration::ZERO, None);
    }

    async fn supervise(&mut self) {
        let (tx, mut triggers) = mpsc::channel(4);
        let _monitors = self.start_monitors(tx);

        let stable_in = self.tracker.min_uptime().saturating_sub(self.process.uptime());
        let stable = tokio::time::sleep(stable_in);
        tokio::pin!(stable);
        let mut stable_reached = false;

        loop {
            tokio::select! {
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    if self.tracker.mark_stable() {
                        info!("[{}] up for {}ms, crash counter reset", self.label, self.tracker.min_uptime().as_millis());
                        self.publish();
                    }
                }
                status = self.process.wait() => {
                    let uptime = self.process.uptime();
                    let reason = match status {
                        Ok(status) => format!("exited with {status}"),
                        Err(e) => format!("wait failed: {e}"),
                    };
                    warn!("[{}] {reason} after {}ms", self.label, uptime.as_millis());
                    self.last_error = Some(reason);
                    return self.after_exit(ProcessState::Crashed, uptime, None);
                }
                Some(trigger) = triggers.recv() => {
                    warn!("[{}] restarting: {trigger}", self.label);
                    let uptime = self.process.uptime();
                    self.last_error = Some(trigger.to_string());
                    self.transition(ProcessState::Stopping);
                    self.process.stop(self.policies.kill_timeout).await;
                    return self.after_exit(ProcessState::Crashed, uptime, Some(&trigger));
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Stop(done)) => {
                        self.stop_waiters.push(done);
                        return self.stop_now().await;
                    }
                    None => return self.stop_now().await,
                    Some(Command::Reset) => {
                        self.tracker.reset();
                        self.publish();
                    }
                    Some(Command::Start) => {}
                },
            }
        }
    }

    fn start_monitors(&self, tx: mpsc::Sender<RestartTrigger>) -> MonitorSet {
        let mut tasks = Vec::new();
        if let Some(cfg) = &self.policies.health {
            match HttpProbe::new(cfg) {
                Ok(probe) => tasks.push(tokio::spawn(health::monitor(
                    self.label.clone(),
                    probe,
                    cfg.interval,
                    cfg.failure_threshold,
                    tx.clone(),
                ))),
                Err(e) => warn!("[{}] health checks disabled: {e}", self.label),
            }
        }
        if let (Some(limit), Some(pid)) = (self.policies.memory_limit, self.process.pid()) {
            tasks.push(tokio::spawn(memory::monitor(
                self.label.clone(),
                pid,
                limit,
                self.settings.memory_poll_interval,
                tx.clone(),
            )));
        }
        if let Some(policy) = &self.policies.watch {
            tasks.push(tokio::spawn(fswatch::monitor(
                self.label.clone(),
                policy.clone(),
                self.settings.watch_poll_interval,
                tx,
            )));
        }
        MonitorSet(tasks)
    }

    async fn stop_now(&mut self) {
        self.transition(ProcessState::Stopping);
        self.process.stop(self.policies.kill_timeout).await;
        self.transition(ProcessState::Stopped);
    }

    /// Decide what follows an exit. `failed` is `Crashed` or `FailedStart`.
    /// Failed starts count as zero uptime.
    fn after_exit(&mut self, failed: ProcessState, uptime: Duration, trigger: Option<&RestartTrigger>) {
        self.transition(failed);

        match trigger {
            Some(t) if !t.counts_as_crash() => {
                return self.transition(ProcessState::Restarting);
            }
            Some(_) => {}
            None if !self.policies.restart.auto_restart => {
                info!("[{}] autorestart disabled, leaving it {failed}", self.label);
                return;
            }
            None => {}
        }

        match self.tracker.record_exit(uptime) {
            RestartDecision::Restart => self.transition(ProcessState::Restarting),
            RestartDecision::GiveUp => {
                let err = SupervisorError::CrashLoopExceeded {
                    label: self.label.clone(),
                    restarts: self.tracker.unstable_restarts(),
                };
                error!("{err}");
                self.last_error = Some(err.to_string());
                self.transition(ProcessState::TerminalFailure);
            }
        }
    }

    async fn restart_after_delay(&mut self) {
        let delay = self.policies.restart.delay;
        if !delay.is_zero() {
            info!("[{}] restarting in {}ms", self.label, delay.as_millis());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = self.commands.recv() => match cmd {
                Some(Command::Stop(done)) => {
                    self.stop_waiters.push(done);
                    return self.transition(ProcessState::Stopped);
                }
                None => return self.transition(ProcessState::Stopped),
                Some(Command::Reset) => self.tracker.reset(),
                Some(Command::Start) => {}
            },
        }
        self.restarts += 1;
        self.transition(ProcessState::Starting);
    }
}
