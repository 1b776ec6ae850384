// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Polling file watcher for `watch: true`. Each pass records the size and
//! modification time of every file below the root; any difference from the
//! previous pass requests a restart.

use crate::instance::RestartTrigger;
use crate::policy::WatchPolicy;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use walkdir::WalkDir;

const SKIPPED_DIRS: &[&str] = &[".git", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Snapshot(BTreeMap<PathBuf, Stamp>);

impl Snapshot {
    pub fn take(policy: &WatchPolicy) -> Self {
        let entries = WalkDir::new(&policy.root)
            .into_iter()
            .filter_entry(|e| !is_skipped(e.path(), policy))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());

        let mut files = BTreeMap::new();
        for entry in entries {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            files.insert(
                entry.into_path(),
                Stamp {
                    modified: meta.modified().ok(),
                    len: meta.len(),
                },
            );
        }
        Snapshot(files)
    }

    /// A path that was added, removed or modified between `self` and `next`.
    pub fn first_difference(&self, next: &Snapshot) -> Option<PathBuf> {
        for (path, stamp) in &next.0 {
            if self.0.get(path) != Some(stamp) {
                return Some(path.clone());
            }
        }
        self.0.keys().find(|p| !next.0.contains_key(*p)).cloned()
    }
}

fn is_skipped(path: &Path, policy: &WatchPolicy) -> bool {
    let hidden_dir = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| SKIPPED_DIRS.contains(&n));
    hidden_dir || policy.ignored.iter().any(|dir| path == dir)
}

async fn snapshot(policy: &WatchPolicy) -> Snapshot {
    let policy = policy.clone();
    tokio::task::spawn_blocking(move || Snapshot::take(&policy))
        .await
        .unwrap_or_default()
}

/// Rescan every `interval` and request a restart on the first change.
pub async fn monitor(
    label: String,
    policy: WatchPolicy,
    interval: Duration,
    triggers: mpsc::Sender<RestartTrigger>,
) {
    let mut previous = snapshot(&policy).await;
    debug!(
        "[{label}] watching {} files under {}",
        previous.0.len(),
        policy.root.display()
    );
    loop {
        tokio::time::sleep(interval).await;
        let current = snapshot(&policy).await;
        if let Some(path) = previous.first_difference(&current) {
            info!("[{label}] change detected: {}", path.display());
            let _ = triggers.send(RestartTrigger::FilesChanged(path)).await;
            return;
        }
        previous = current;
    }
}
