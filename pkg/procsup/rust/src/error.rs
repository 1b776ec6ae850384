// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A process configuration that cannot be turned into a descriptor.
/// Raised at load time, before anything is spawned.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("configuration declares no process")]
    NoProcess,

    #[error("expected exactly one process, found {0}")]
    MultipleProcesses(usize),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("`name` must not be empty")]
    EmptyName,

    #[error("duplicate process name `{0}`")]
    DuplicateName(String),

    #[error("`{field}` must not be negative")]
    NegativeDuration { field: &'static str },

    #[error("invalid `{field}` value {value:?}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("`cwd` must be an absolute path, got {}", .0.display())]
    RelativeWorkingDirectory(PathBuf),
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, value: impl ToString, reason: &'static str) -> Self {
        ValidationError::InvalidValue {
            field,
            value: value.to_string(),
            reason,
        }
    }
}

/// A process that could not be started. Counts as a failed start.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable not found: {command}")]
    NotFound { command: String },

    #[error("permission denied executing {command}")]
    PermissionDenied { command: String },

    #[error("working directory does not exist: {}", .0.display())]
    MissingWorkingDirectory(PathBuf),

    #[error("cannot open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind readiness socket: {0}")]
    Readiness(#[source] io::Error),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub(crate) fn from_spawn(command: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound {
                command: command.to_string(),
            },
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                command: command.to_string(),
            },
            _ => LaunchError::Spawn {
                command: command.to_string(),
                source,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no process named `{0}`")]
    UnknownProcess(String),

    #[error("process `{0}` is already managed")]
    AlreadyManaged(String),

    #[error("[{label}] {restarts} consecutive runs shorter than min_uptime, giving up")]
    CrashLoopExceeded { label: String, restarts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_errors_are_classified() {
        let err = LaunchError::from_spawn("/nope", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, LaunchError::NotFound { .. }));

        let err = LaunchError::from_spawn("/etc", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, LaunchError::PermissionDenied { .. }));

        let err = LaunchError::from_spawn("/x", io::Error::other("boom"));
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[test]
    fn test_crash_loop_message() {
        let err = SupervisorError::CrashLoopExceeded {
            label: "api:0".to_string(),
            restarts: 10,
        };
        assert_eq!(
            err.to_string(),
            "[api:0] 10 consecutive runs shorter than min_uptime, giving up"
        );
    }
}
