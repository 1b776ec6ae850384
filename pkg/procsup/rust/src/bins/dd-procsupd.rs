// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use dd_procsup::{Settings, Supervisor, load_file};
use log::{error, info};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug)]
#[command(name = "dd-procsupd", version, about = "Supervise processes described by a PM2-style config")]
struct Args {
    /// Process configuration file (YAML or JSON).
    #[arg(short, long, env = "DD_PROCSUP_CONFIG")]
    config: PathBuf,

    /// Validate the configuration, print it normalized, and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()?;

    let descriptors = load_file(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    if args.check {
        for d in &descriptors {
            print!("---\n{}", d.to_yaml()?);
        }
        return Ok(());
    }

    info!(
        "dd-procsupd starting (version {})",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "loaded {} process config(s) from {}",
        descriptors.len(),
        args.config.display()
    );

    let mut supervisor = Supervisor::new(Settings::from_env());
    for d in descriptors {
        let name = d.name.clone();
        if let Err(e) = supervisor.start(d) {
            error!("[{name}] {e}");
        }
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading {}", args.config.display());
                match load_file(&args.config) {
                    Ok(descriptors) => {
                        supervisor.reload(descriptors).await;
                    }
                    Err(e) => error!("reload failed, keeping current processes: {e}"),
                }
            }
        }
    }

    info!("dd-procsupd shutting down");
    supervisor.shutdown().await;
    Ok(())
}
