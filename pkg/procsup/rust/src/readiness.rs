// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Readiness notification. A child started with `wait_ready` finds a Unix
//! datagram socket path in `NOTIFY_SOCKET` and sends `READY=1` to it once it
//! can serve traffic, the same protocol as systemd's `sd_notify`.

use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixDatagram;
use tokio::time::{Instant, timeout_at};

pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
pub const READY_MESSAGE: &str = "READY=1";

pub struct ReadyListener {
    path: PathBuf,
    socket: UnixDatagram,
}

impl ReadyListener {
    /// Bind a fresh socket under `runtime_dir` for the instance `label`.
    pub fn bind(runtime_dir: &Path, label: &str) -> io::Result<Self> {
        std::fs::create_dir_all(runtime_dir)?;
        let path = runtime_dir.join(format!("{}.notify", socket_file_stem(label)));
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("[{label}] removed stale readiness socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self { path, socket })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `limit` for a `READY=1` notification. Other datagrams
    /// (status updates and the like) are ignored.
    pub async fn wait_ready(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut buf = [0u8; 4096];
        loop {
            match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Err(_) => return false,
                Ok(Err(e)) => {
                    warn!("readiness socket {}: {e}", self.path.display());
                    return false;
                }
                Ok(Ok(n)) => {
                    let msg = String::from_utf8_lossy(&buf[..n]);
                    if msg.lines().any(|l| l.trim() == READY_MESSAGE) {
                        return true;
                    }
                }
            }
        }
    }
}

/// Percent-encode everything outside `[A-Za-z0-9-]` so that distinct
/// labels never share a socket path.
fn socket_file_stem(label: &str) -> String {
    let mut stem = String::with_capacity(label.len());
    for byte in label.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

impl Drop for ReadyListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram as StdDatagram;

    #[tokio::test]
    async fn test_ready_message_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let listener = ReadyListener::bind(dir.path(), "web:0").unwrap();
        assert_eq!(listener.path(), dir.path().join("web%3A0.notify"));

        let client = StdDatagram::unbound().unwrap();
        client.send_to(b"STATUS=warming up", listener.path()).unwrap();
        client.send_to(b"READY=1\n", listener.path()).unwrap();

        assert!(listener.wait_ready(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_socket_file_stem_is_unambiguous() {
        assert_eq!(socket_file_stem("api-2:0"), "api-2%3A0");
        assert_eq!(socket_file_stem("api.v1:0"), "api%2Ev1%3A0");
        assert_eq!(socket_file_stem("api_v1:0"), "api%5Fv1%3A0");
        assert_eq!(socket_file_stem("a%b"), "a%25b");
        assert_eq!(socket_file_stem("café"), "caf%C3%A9");
    }

    #[tokio::test]
    async fn test_similar_labels_get_their_own_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let dotted = ReadyListener::bind(dir.path(), "api.v1:0").unwrap();
        let underscored = ReadyListener::bind(dir.path(), "api_v1:0").unwrap();
        assert_ne!(dotted.path(), underscored.path());

        let client = StdDatagram::unbound().unwrap();
        client.send_to(b"READY=1", dotted.path()).unwrap();
        assert!(dotted.wait_ready(Duration::from_secs(5)).await);
        assert!(!underscored.wait_ready(Duration::from_millis(100)).await);

        client.send_to(b"READY=1", underscored.path()).unwrap();
        assert!(underscored.wait_ready(Duration::from_secs(5)).await);

        let underscored_path = underscored.path().to_path_buf();
        drop(dotted);
        assert!(underscored_path.exists());
    }

    #[tokio::test]
    async fn test_times_out_without_message() {
        let dir = tempfile::tempdir().unwrap();
        let listener = ReadyListener::bind(dir.path(), "quiet").unwrap();
        let start = Instant::now();
        assert!(!listener.wait_ready(Duration::from_millis(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let first = ReadyListener::bind(dir.path(), "app").unwrap();
        let path = first.path().to_path_buf();
        std::mem::forget(first);
        assert!(path.exists());

        let second = ReadyListener::bind(dir.path(), "app").unwrap();
        assert_eq!(second.path(), path);
        drop(second);
        assert!(!path.exists());
    }
}
