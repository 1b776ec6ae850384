// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Resident memory sampling from procfs for `max_memory_restart`.

use crate::instance::RestartTrigger;
use crate::units::format_bytes;
use log::{debug, warn};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| match env::var("HOST_PROC") {
        Ok(v) => v.into(),
        Err(_) => "/proc".into(),
    })
}

/// Parse the `VmRSS` line of a `/proc/<pid>/status` document into bytes.
pub fn parse_status_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => value.checked_mul(1024),
        Some(_) => None,
    }
}

/// Resident set size of `pid`, or `None` if the process is gone or the
/// value is unavailable (kernel threads have no `VmRSS`).
pub fn resident_bytes(pid: u32) -> Option<u64> {
    let path = root_path().join(pid.to_string()).join("status");
    let status = std::fs::read_to_string(path).ok()?;
    parse_status_rss(&status)
}

/// Sample `pid` every `interval` and request a restart the first time its
/// resident memory is above `limit`.
pub async fn monitor(
    label: String,
    pid: u32,
    limit: u64,
    interval: Duration,
    triggers: mpsc::Sender<RestartTrigger>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(rss) = resident_bytes(pid) else {
            debug!("[{label}] no memory reading for pid {pid}");
            continue;
        };
        if rss > limit {
            warn!(
                "[{label}] memory {} exceeds limit {}",
                format_bytes(rss),
                format_bytes(limit)
            );
            let _ = triggers
                .send(RestartTrigger::MemoryExceeded { rss, limit })
                .await;
            return;
        }
    }
}
