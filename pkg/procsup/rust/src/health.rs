// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! HTTP health polling. A probe is healthy when the endpoint answers with a
//! 2xx status within the configured timeout. `failure_threshold` consecutive
//! unhealthy probes request a restart.

use crate::descriptor::HealthCheckConfig;
use crate::instance::RestartTrigger;
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no response within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(config: &HealthCheckConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ProbeError::Request)?;
        Ok(Self {
            client,
            url: config.url.clone(),
            timeout: config.timeout,
        })
    }

    pub async fn check(&self) -> Result<u16, ProbeError> {
        let resp = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Request(e)
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

/// Poll `probe` every `interval` until the trigger channel closes or the
/// task is aborted. The first probe runs one interval after start.
pub async fn monitor(
    label: String,
    probe: HttpProbe,
    interval: Duration,
    threshold: u32,
    triggers: mpsc::Sender<RestartTrigger>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        ticker.tick().await;
        match probe.check().await {
            Ok(status) => {
                if failures > 0 {
                    info!("[{label}] health check recovered (status {status})");
                } else {
                    debug!("[{label}] health check passed (status {status})");
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!("[{label}] health check failed ({failures}/{threshold}): {e}");
                if failures >= threshold {
                    let _ = triggers.send(RestartTrigger::Unhealthy { failures }).await;
                    return;
                }
            }
        }
    }
}
