// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Copies child output into the combined/out/error log files, one
//! timestamped line at a time. Write failures never stop the pipeline: the
//! line is dropped and a single warning is logged until writes recover.

use crate::error::LaunchError;
use crate::policy::LogPolicy;
use crate::timefmt::TimestampFormat;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

/// Longer lines are split so a child that never writes a newline cannot
/// grow the buffer without bound.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

struct SinkFile {
    path: PathBuf,
    file: Mutex<File>,
    degraded: AtomicBool,
}

impl SinkFile {
    fn open(path: &Path) -> Result<Self, LaunchError> {
        let log_err = |source| LaunchError::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(log_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(log_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            degraded: AtomicBool::new(false),
        })
    }

    fn write(&self, entry: &[u8]) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match file.write_all(entry) {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("log writes to {} recovered", self.path.display());
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        "failed writing to {}: {e}; dropping log lines",
                        self.path.display()
                    );
                }
            }
        }
    }
}

/// The three log files of one process.
pub struct LogSinks {
    combined: SinkFile,
    out: SinkFile,
    error: SinkFile,
    timestamp: TimestampFormat,
}

impl LogSinks {
    /// Open (creating if needed) all three files in append mode.
    pub fn open(policy: &LogPolicy) -> Result<Self, LaunchError> {
        Ok(Self {
            combined: SinkFile::open(&policy.paths.combined)?,
            out: SinkFile::open(&policy.paths.out)?,
            error: SinkFile::open(&policy.paths.error)?,
            timestamp: policy.timestamp.clone(),
        })
    }

    pub fn record(&self, stream: Stream, line: &str) {
        let entry = format!("{}: {line}\n", self.timestamp.render_now());
        self.combined.write(entry.as_bytes());
        match stream {
            Stream::Stdout => self.out.write(entry.as_bytes()),
            Stream::Stderr => self.error.write(entry.as_bytes()),
        }
    }
}

/// Forward `reader` line by line until EOF. Invalid UTF-8 is replaced
/// rather than ending the stream, so the child never blocks on a full pipe.
/// File writes run on the blocking pool, one line at a time to keep order.
pub fn forward<R>(reader: R, stream: Stream, sinks: Arc<LogSinks>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
            match limited.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    let sinks = Arc::clone(&sinks);
                    if let Err(e) =
                        tokio::task::spawn_blocking(move || sinks.record(stream, &line)).await
                    {
                        warn!("log write task failed: {e}");
                    }
                }
                Err(e) => {
                    warn!("log forwarding stopped: {e}");
                    break;
                }
            }
        }
    })
}
