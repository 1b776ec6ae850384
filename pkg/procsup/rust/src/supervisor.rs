// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The process table. Each managed app owns one control loop per instance;
//! descriptors are shared read-only and replaced wholesale on reload.

use crate::descriptor::ProcessDescriptor;
use crate::error::SupervisorError;
use crate::instance::{InstanceHandle, InstanceStatus};
use crate::policy::Policies;
use crate::process::{LOG_DRAIN_TIMEOUT, SIGKILL_TIMEOUT};
use crate::settings::Settings;
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, timeout_at};

/// Time allowed on top of `kill_timeout` for the SIGKILLed child to be
/// reaped and its output flushed, plus slack for the control loop.
const STOP_GRACE: Duration = SIGKILL_TIMEOUT
    .saturating_add(LOG_DRAIN_TIMEOUT)
    .saturating_add(Duration::from_secs(1));

struct ManagedApp {
    descriptor: Arc<ProcessDescriptor>,
    policies: Arc<Policies>,
    instances: Vec<InstanceHandle>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: Vec<String>,
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct Supervisor {
    settings: Arc<Settings>,
    apps: BTreeMap<String, ManagedApp>,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            apps: BTreeMap::new(),
        }
    }

    /// Take `descriptor` under management and start all of its instances.
    pub fn start(&mut self, descriptor: ProcessDescriptor) -> Result<(), SupervisorError> {
        if self.apps.contains_key(&descriptor.name) {
            return Err(SupervisorError::AlreadyManaged(descriptor.name));
        }
        let policies = Arc::new(Policies::from(&descriptor));
        let name = descriptor.name.clone();
        info!(
            "[{name}] starting {} instance(s) of {}",
            policies.launch.instances, policies.launch.command
        );
        let instances = (0..policies.launch.instances)
            .map(|id| {
                InstanceHandle::spawn(&name, id, Arc::clone(&policies), Arc::clone(&self.settings))
            })
            .collect();
        self.apps.insert(
            name,
            ManagedApp {
                descriptor: Arc::new(descriptor),
                policies,
                instances,
            },
        );
        Ok(())
    }

    /// Start the app's stopped or crashed instances again.
    pub fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        for instance in &self.app(name)?.instances {
            instance.start();
        }
        Ok(())
    }

    /// Gracefully stop every instance of `name`. Stopping a stopped app is a
    /// no-op.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let app = self.app(name)?;
        stop_instances(&[(name, app)]).await;
        Ok(())
    }

    /// Clear terminal failure and crash counters, then start again.
    pub fn reset(&self, name: &str) -> Result<(), SupervisorError> {
        info!("[{name}] reset requested");
        for instance in &self.app(name)?.instances {
            instance.reset();
        }
        Ok(())
    }

    /// Stop `name` and forget it.
    pub async fn remove(&mut self, name: &str) -> Result<Arc<ProcessDescriptor>, SupervisorError> {
        self.stop(name).await?;
        let app = self
            .apps
            .remove(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        info!("[{name}] removed");
        Ok(app.descriptor)
    }

    pub fn status(&self, name: &str) -> Result<Vec<InstanceStatus>, SupervisorError> {
        Ok(self.app(name)?.instances.iter().map(|i| i.status()).collect())
    }

    pub fn subscribe(
        &self,
        name: &str,
        instance: u32,
    ) -> Result<watch::Receiver<InstanceStatus>, SupervisorError> {
        self.app(name)?
            .instances
            .get(instance as usize)
            .map(InstanceHandle::subscribe)
            .ok_or_else(|| SupervisorError::UnknownProcess(format!("{name}:{instance}")))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ProcessDescriptor> {
        self.apps.get(name).map(|a| a.descriptor.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    /// Converge on `descriptors`: stop apps no longer listed, replace apps
    /// whose descriptor changed, start new ones. Unchanged apps keep running.
    pub async fn reload(&mut self, descriptors: Vec<ProcessDescriptor>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut incoming: BTreeMap<String, ProcessDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let stale: Vec<String> = self
            .apps
            .iter()
            .filter(|(name, app)| {
                incoming
                    .get(*name)
                    .is_none_or(|d| *d != *app.descriptor)
            })
            .map(|(name, _)| name.clone())
            .collect();
        let stopping: Vec<(&str, &ManagedApp)> = stale
            .iter()
            .filter_map(|name| self.apps.get_key_value(name).map(|(n, a)| (n.as_str(), a)))
            .collect();
        stop_instances(&stopping).await;
        for name in stale {
            self.apps.remove(&name);
            if incoming.contains_key(&name) {
                summary.replaced.push(name);
            } else {
                summary.removed.push(name);
            }
        }

        for name in self.apps.keys() {
            incoming.remove(name);
            summary.unchanged.push(name.clone());
        }
        for (name, descriptor) in incoming {
            // Names are unique and absent from the table at this point.
            if self.start(descriptor).is_ok() && !summary.replaced.contains(&name) {
                summary.started.push(name);
            }
        }

        info!(
            "reload: {} started, {} replaced, {} removed, {} unchanged",
            summary.started.len(),
            summary.replaced.len(),
            summary.removed.len(),
            summary.unchanged.len()
        );
        summary
    }

    /// Stop everything, SIGTERM to all instances first.
    pub async fn shutdown(&mut self) {
        let all: Vec<(&str, &ManagedApp)> =
            self.apps.iter().map(|(n, a)| (n.as_str(), a)).collect();
        stop_instances(&all).await;
        self.apps.clear();
    }

    fn app(&self, name: &str) -> Result<&ManagedApp, SupervisorError> {
        self.apps
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))
    }
}

/// Request a stop of every instance at once, then wait for all of them,
/// bounded by the longest kill timeout plus [`STOP_GRACE`].
async fn stop_instances(apps: &[(&str, &ManagedApp)]) {
    if apps.is_empty() {
        return;
    }
    let mut pending = Vec::new();
    let mut bound = Duration::ZERO;
    for (name, app) in apps {
        bound = bound.max(app.policies.kill_timeout + STOP_GRACE);
        for instance in &app.instances {
            pending.push((*name, instance.request_stop()));
        }
    }

    let deadline = Instant::now() + bound;
    for (name, done) in pending {
        if timeout_at(deadline, done).await.is_err() {
            warn!("[{name}] still stopping after {}ms", bound.as_millis());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::make_descriptor;
    use crate::descriptor::{ExecMode, InstanceCount};
    use crate::state::ProcessState;
    use std::path::Path;

    fn supervisor(dir: &Path) -> Supervisor {
        Supervisor::new(Settings {
            runtime_dir: dir.join("run"),
            memory_poll_interval: Duration::from_millis(50),
            watch_poll_interval: Duration::from_millis(50),
        })
    }

    fn sleeper(dir: &Path, name: &str) -> ProcessDescriptor {
        let mut d = make_descriptor(dir, "/bin/sleep", &["60"]);
        d.name = name.to_string();
        d
    }

    async fn wait_running(sup: &Supervisor, name: &str, instance: u32) -> InstanceStatus {
        let mut rx = sup.subscribe(name, instance).unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| s.state == ProcessState::Running),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        sup.start(sleeper(dir.path(), "web")).unwrap();
        wait_running(&sup, "web", 0).await;

        sup.stop("web").await.unwrap();
        let status = sup.status("web").unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, ProcessState::Stopped);

        // Idempotent.
        sup.stop("web").await.unwrap();
        assert_eq!(sup.status("web").unwrap()[0].state, ProcessState::Stopped);

        sup.restart("web").unwrap();
        wait_running(&sup, "web", 0).await;
        sup.shutdown().await;
        assert_eq!(sup.names().count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        sup.start(sleeper(dir.path(), "web")).unwrap();
        assert!(matches!(
            sup.start(sleeper(dir.path(), "web")),
            Err(SupervisorError::AlreadyManaged(_))
        ));
        assert!(matches!(
            sup.stop("nope").await,
            Err(SupervisorError::UnknownProcess(_))
        ));
        assert!(matches!(sup.status("nope"), Err(SupervisorError::UnknownProcess(_))));
        assert!(sup.subscribe("web", 1).is_err());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_cluster_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let mut d = sleeper(dir.path(), "api");
        d.execution_mode = ExecMode::Cluster;
        d.instance_count = InstanceCount::Fixed(3);
        sup.start(d).unwrap();

        let mut pids = Vec::new();
        for id in 0..3 {
            pids.push(wait_running(&sup, "api", id).await.pid.unwrap());
        }
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 3);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_fork_mode_runs_single_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let mut d = sleeper(dir.path(), "api");
        d.instance_count = InstanceCount::Fixed(3);
        sup.start(d).unwrap();
        assert_eq!(sup.status("api").unwrap().len(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_bounded_for_stubborn_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let mut d = make_descriptor(dir.path(), "/bin/sh", &["-c", "trap '' TERM; exec sleep 60"]);
        d.name = "stubborn".into();
        d.kill_timeout = Duration::from_millis(300);
        sup.start(d).unwrap();
        wait_running(&sup, "stubborn", 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::Instant::now();
        sup.stop("stubborn").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300) + STOP_GRACE);
        assert_eq!(sup.status("stubborn").unwrap()[0].state, ProcessState::Stopped);
        sup.shutdown().await;
    }

    #[test]
    fn test_stop_grace_covers_reap_and_drain() {
        assert!(STOP_GRACE > SIGKILL_TIMEOUT + LOG_DRAIN_TIMEOUT);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_waits_for_process_tree() {
        use crate::process::tests::{read_pid_file, wait_gone};

        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let mut d = make_descriptor(
            dir.path(),
            "/bin/sh",
            &["-c", "(trap '' TERM; exec sleep 300) & echo $! > grandchild.pid; wait"],
        );
        d.name = "tree".into();
        d.kill_timeout = Duration::from_millis(500);
        sup.start(d).unwrap();
        wait_running(&sup, "tree", 0).await;
        let grandchild = read_pid_file(&dir.path().join("grandchild.pid")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::Instant::now();
        sup.stop("tree").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert_eq!(sup.status("tree").unwrap()[0].state, ProcessState::Stopped);
        assert!(wait_gone(grandchild, Duration::from_secs(2)).await);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_unknown_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        assert!(sup.reset("ghost").is_err());
        sup.start(sleeper(dir.path(), "web")).unwrap();
        wait_running(&sup, "web", 0).await;
        let removed = sup.remove("web").await.unwrap();
        assert_eq!(removed.name, "web");
        assert!(sup.descriptor("web").is_none());
    }

    #[tokio::test]
    async fn test_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        sup.start(sleeper(dir.path(), "keep")).unwrap();
        sup.start(sleeper(dir.path(), "change")).unwrap();
        sup.start(sleeper(dir.path(), "drop")).unwrap();
        let keep_pid = wait_running(&sup, "keep", 0).await.pid;
        let change_pid = wait_running(&sup, "change", 0).await.pid;

        let mut changed = sleeper(dir.path(), "change");
        changed.arguments = vec!["120".into()];
        let summary = sup
            .reload(vec![
                sleeper(dir.path(), "keep"),
                changed,
                sleeper(dir.path(), "new"),
            ])
            .await;

        assert_eq!(summary.unchanged, vec!["keep".to_string()]);
        assert_eq!(summary.replaced, vec!["change".to_string()]);
        assert_eq!(summary.removed, vec!["drop".to_string()]);
        assert_eq!(summary.started, vec!["new".to_string()]);

        assert_eq!(sup.names().collect::<Vec<_>>(), vec!["change", "keep", "new"]);
        assert_eq!(wait_running(&sup, "keep", 0).await.pid, keep_pid);
        assert_ne!(wait_running(&sup, "change", 0).await.pid, change_pid);
        assert_eq!(sup.descriptor("change").unwrap().arguments, vec!["120"]);
        sup.shutdown().await;
    }
}
