// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The process descriptor: an immutable, validated description of one
//! managed application, loaded from a PM2-style YAML or JSON document.
//!
//! Three document shapes are accepted: a single app object, a sequence of
//! app objects, or an ecosystem wrapper `{apps: [...]}`. Numeric durations
//! are milliseconds; strings such as `10s` are accepted as well.

use crate::error::ValidationError;
use crate::units::{parse_duration, parse_memory};
use log::warn;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOG_DATE_FORMAT: &str = "YYYY-MM-DD HH:mm:ss Z";
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RESTARTS: u32 = 16;
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1600);
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// How many copies of the process to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCount {
    Fixed(u32),
    /// One per available core (`"max"` or `0`).
    PerCore,
    /// Available cores minus n, at least one (`-n`).
    PerCoreMinus(u32),
}

impl InstanceCount {
    pub fn resolve(self) -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(1);
        self.resolve_with(cores)
    }

    pub fn resolve_with(self, cores: u32) -> u32 {
        match self {
            InstanceCount::Fixed(n) => n,
            InstanceCount::PerCore => cores.max(1),
            InstanceCount::PerCoreMinus(n) => cores.saturating_sub(n).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// A single process.
    #[default]
    Fork,
    /// Several load-balanced workers sharing the listening port.
    Cluster,
}

impl ExecMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fork" | "fork_mode" => Some(ExecMode::Fork),
            "cluster" | "cluster_mode" => Some(ExecMode::Cluster),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ExecMode::Fork => "fork",
            ExecMode::Cluster => "cluster",
        }
    }
}

/// Where the process output goes. All paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    /// stdout and stderr interleaved.
    pub combined: PathBuf,
    pub out: PathBuf,
    pub error: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed probes before the process is restarted.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub name: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub instance_count: InstanceCount,
    pub execution_mode: ExecMode,
    pub log_paths: LogPaths,
    pub log_timestamp_format: String,
    pub auto_restart: bool,
    pub watch_filesystem: bool,
    pub max_memory_bytes: Option<u64>,
    pub min_uptime: Duration,
    pub max_restart_attempts: u32,
    pub kill_timeout: Duration,
    pub wait_for_ready_signal: bool,
    pub listen_timeout: Duration,
    pub restart_delay: Duration,
    pub health_check: Option<HealthCheckConfig>,
}

/// Parse a document declaring exactly one process.
pub fn load(source: &str) -> Result<ProcessDescriptor, ValidationError> {
    let mut descriptors = parse_document(source, None)?;
    match descriptors.len() {
        0 => Err(ValidationError::NoProcess),
        1 => descriptors.pop().ok_or(ValidationError::NoProcess),
        n => Err(ValidationError::MultipleProcesses(n)),
    }
}

/// Parse a document declaring one or more processes with unique names.
pub fn load_all(source: &str) -> Result<Vec<ProcessDescriptor>, ValidationError> {
    let descriptors = parse_document(source, None)?;
    check_unique(&descriptors)?;
    Ok(descriptors)
}

/// Read and parse a configuration file. Processes without `cwd` run in the
/// file's directory, and relative `cwd` values are resolved against it.
pub fn load_file(path: &Path) -> Result<Vec<ProcessDescriptor>, ValidationError> {
    let read_err = |source| ValidationError::Read {
        path: path.to_path_buf(),
        source,
    };
    let contents = std::fs::read_to_string(path).map_err(read_err)?;
    let absolute = std::path::absolute(path).map_err(read_err)?;
    let base_dir = absolute.parent().unwrap_or(Path::new("/"));
    let descriptors = parse_document(&contents, Some(base_dir))?;
    check_unique(&descriptors)?;
    Ok(descriptors)
}

fn check_unique(descriptors: &[ProcessDescriptor]) -> Result<(), ValidationError> {
    if descriptors.is_empty() {
        return Err(ValidationError::NoProcess);
    }
    let mut seen = HashSet::new();
    for d in descriptors {
        if !seen.insert(d.name.as_str()) {
            return Err(ValidationError::DuplicateName(d.name.clone()));
        }
    }
    Ok(())
}

fn parse_document(
    source: &str,
    base_dir: Option<&Path>,
) -> Result<Vec<ProcessDescriptor>, ValidationError> {
    let malformed = |e: serde_yaml::Error| ValidationError::Malformed(e.to_string());
    let doc: serde_yaml::Value = serde_yaml::from_str(source).map_err(malformed)?;

    let raw_apps: Vec<RawApp> = match doc {
        serde_yaml::Value::Mapping(ref map) if map.contains_key("apps") => {
            let apps = map.get("apps").cloned().unwrap_or_default();
            serde_yaml::from_value(apps).map_err(malformed)?
        }
        serde_yaml::Value::Sequence(_) => serde_yaml::from_value(doc).map_err(malformed)?,
        serde_yaml::Value::Mapping(_) => vec![serde_yaml::from_value(doc).map_err(malformed)?],
        serde_yaml::Value::Null => Vec::new(),
        _ => {
            return Err(ValidationError::Malformed(
                "expected a process object, a list, or an `apps` list".to_string(),
            ));
        }
    };

    raw_apps
        .into_iter()
        .map(|raw| ProcessDescriptor::from_raw(raw, base_dir))
        .collect()
}

impl ProcessDescriptor {
    /// Render the descriptor with the conventional configuration keys.
    /// Loading the output yields an equal descriptor.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// The process label used in log lines for a given instance.
    pub fn instance_label(&self, instance: u32) -> String {
        format!("{}:{instance}", self.name)
    }

    fn from_raw(raw: RawApp, base_dir: Option<&Path>) -> Result<Self, ValidationError> {
        let name = raw.name.ok_or(ValidationError::MissingField("name"))?;
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let command = raw.script.ok_or(ValidationError::MissingField("script"))?;
        if command.trim().is_empty() {
            return Err(ValidationError::invalid("script", &command, "must not be empty"));
        }

        let arguments = match raw.args {
            None => Vec::new(),
            Some(RawArgs::List(items)) => items.into_iter().map(Scalar::into_string).collect(),
            Some(RawArgs::Line(line)) => split_args(&line)?,
        };

        let working_directory = match (raw.cwd, base_dir) {
            (Some(cwd), _) if cwd.is_absolute() => clean(&cwd),
            (Some(cwd), Some(base)) => clean(&base.join(cwd)),
            (Some(cwd), None) => return Err(ValidationError::RelativeWorkingDirectory(cwd)),
            (None, Some(base)) => clean(base),
            (None, None) => return Err(ValidationError::MissingField("cwd")),
        };

        let environment = raw
            .env
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.into_string()))
            .collect();

        let instance_count = match raw.instances {
            None => InstanceCount::Fixed(1),
            Some(value) => parse_instances(&value)?,
        };

        let execution_mode = match raw.exec_mode {
            None => ExecMode::default(),
            Some(mode) => ExecMode::parse(&mode)
                .ok_or_else(|| ValidationError::invalid("exec_mode", &mode, "expected fork or cluster"))?,
        };

        let resolve = |path: Option<PathBuf>, default: String| {
            let path = path.unwrap_or_else(|| Path::new("logs").join(default));
            clean(&working_directory.join(path))
        };
        let log_paths = LogPaths {
            combined: resolve(raw.log_file, format!("{name}.log")),
            out: resolve(raw.out_file, format!("{name}-out.log")),
            error: resolve(raw.error_file, format!("{name}-error.log")),
        };

        let max_memory_bytes = raw
            .max_memory_restart
            .as_ref()
            .map(parse_memory_limit)
            .transpose()?;

        let max_restart_attempts = match raw.max_restarts {
            None => DEFAULT_MAX_RESTARTS,
            Some(n) => u32::try_from(n)
                .map_err(|_| ValidationError::invalid("max_restarts", n, "must be between 0 and 2^32-1"))?,
        };

        let health_check = raw.health_check_http.map(parse_health_check).transpose()?;

        let watch_filesystem = raw.watch.unwrap_or(false);
        if watch_filesystem {
            warn!("[{name}] watch is enabled: restarts on file changes, do not use in production");
        }

        Ok(ProcessDescriptor {
            command,
            arguments,
            environment,
            instance_count,
            execution_mode,
            log_paths,
            log_timestamp_format: raw
                .log_date_format
                .unwrap_or_else(|| DEFAULT_LOG_DATE_FORMAT.to_string()),
            auto_restart: raw.autorestart.unwrap_or(true),
            watch_filesystem,
            max_memory_bytes,
            min_uptime: duration_field("min_uptime", raw.min_uptime.as_ref(), DEFAULT_MIN_UPTIME)?,
            max_restart_attempts,
            kill_timeout: duration_field("kill_timeout", raw.kill_timeout.as_ref(), DEFAULT_KILL_TIMEOUT)?,
            wait_for_ready_signal: raw.wait_ready.unwrap_or(false),
            listen_timeout: duration_field(
                "listen_timeout",
                raw.listen_timeout.as_ref(),
                DEFAULT_LISTEN_TIMEOUT,
            )?,
            restart_delay: duration_field("restart_delay", raw.restart_delay.as_ref(), Duration::ZERO)?,
            health_check,
            working_directory,
            name,
        })
    }
}

impl Serialize for ProcessDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawApp::from(self).serialize(serializer)
    }
}

/// Deserializes through the same validation as [`load`]; `cwd` must be
/// absolute.
impl<'de> Deserialize<'de> for ProcessDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawApp::deserialize(deserializer)?;
        ProcessDescriptor::from_raw(raw, None).map_err(D::Error::custom)
    }
}

/// Strip `.` components so `./logs/out.log` and `logs/out.log` compare equal.
fn clean(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Durations and sizes are rendered as signed integers, so anything that
/// does not fit one is refused at load time.
const MAX_RENDERABLE: u64 = i64::MAX as u64;

fn millis(d: Duration) -> Scalar {
    Scalar::Int(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn duration_field(
    field: &'static str,
    value: Option<&Scalar>,
    default: Duration,
) -> Result<Duration, ValidationError> {
    let parsed = parse_duration_value(field, value, default)?;
    if parsed.as_millis() > u128::from(MAX_RENDERABLE) {
        let shown = value.map(|v| v.clone().into_string()).unwrap_or_default();
        return Err(ValidationError::invalid(field, shown, "duration is too large"));
    }
    Ok(parsed)
}

fn parse_duration_value(
    field: &'static str,
    value: Option<&Scalar>,
    default: Duration,
) -> Result<Duration, ValidationError> {
    match value {
        None => Ok(default),
        Some(Scalar::Int(n)) => u64::try_from(*n)
            .map(Duration::from_millis)
            .map_err(|_| ValidationError::NegativeDuration { field }),
        Some(Scalar::Float(f)) if *f < 0.0 => Err(ValidationError::NegativeDuration { field }),
        Some(Scalar::Float(f)) if f.is_finite() => Ok(Duration::from_millis(*f as u64)),
        Some(Scalar::Str(s)) if s.trim_start().starts_with('-') => {
            Err(ValidationError::NegativeDuration { field })
        }
        Some(Scalar::Str(s)) => parse_duration(s)
            .ok_or_else(|| ValidationError::invalid(field, s, "expected milliseconds or e.g. `10s`")),
        Some(other) => Err(ValidationError::invalid(field, other.clone().into_string(), "expected a duration")),
    }
}

fn parse_instances(value: &Scalar) -> Result<InstanceCount, ValidationError> {
    let from_int = |n: i64| match n {
        0 => Ok(InstanceCount::PerCore),
        n if n > 0 => u32::try_from(n)
            .map(InstanceCount::Fixed)
            .map_err(|_| ValidationError::invalid("instances", n, "too large")),
        n => u32::try_from(n.unsigned_abs())
            .map(InstanceCount::PerCoreMinus)
            .map_err(|_| ValidationError::invalid("instances", n, "too small")),
    };
    match value {
        Scalar::Int(n) => from_int(*n),
        Scalar::Str(s) if s.eq_ignore_ascii_case("max") => Ok(InstanceCount::PerCore),
        Scalar::Str(s) => match s.trim().parse::<i64>() {
            Ok(n) => from_int(n),
            Err(_) => Err(ValidationError::invalid("instances", s, "expected a count or `max`")),
        },
        other => Err(ValidationError::invalid(
            "instances",
            other.clone().into_string(),
            "expected a count or `max`",
        )),
    }
}

fn parse_memory_limit(value: &Scalar) -> Result<u64, ValidationError> {
    const FIELD: &str = "max_memory_restart";
    let bytes = match value {
        Scalar::Int(n) => u64::try_from(*n)
            .map_err(|_| ValidationError::invalid(FIELD, n, "must not be negative")),
        Scalar::Str(s) => {
            parse_memory(s).ok_or_else(|| ValidationError::invalid(FIELD, s, "expected bytes or e.g. `500M`"))
        }
        other => Err(ValidationError::invalid(FIELD, other.clone().into_string(), "expected a size")),
    }?;
    if bytes > MAX_RENDERABLE {
        return Err(ValidationError::invalid(FIELD, value.clone().into_string(), "size is too large"));
    }
    Ok(bytes)
}

fn parse_health_check(raw: RawHealthCheck) -> Result<HealthCheckConfig, ValidationError> {
    let url = raw.url.ok_or(ValidationError::MissingField("health_check_http.url"))?;
    match reqwest::Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(_) => return Err(ValidationError::invalid("health_check_http.url", &url, "scheme must be http or https")),
        Err(_) => return Err(ValidationError::invalid("health_check_http.url", &url, "not a valid URL")),
    }

    let interval = duration_field("health_check_http.interval", raw.interval.as_ref(), DEFAULT_HEALTH_INTERVAL)?;
    if interval.is_zero() {
        return Err(ValidationError::invalid("health_check_http.interval", 0, "must be positive"));
    }
    let timeout = duration_field("health_check_http.timeout", raw.timeout.as_ref(), DEFAULT_HEALTH_TIMEOUT)?;
    if timeout.is_zero() {
        return Err(ValidationError::invalid("health_check_http.timeout", 0, "must be positive"));
    }

    let failure_threshold = raw.failure_threshold.unwrap_or(DEFAULT_HEALTH_FAILURE_THRESHOLD);
    if failure_threshold == 0 {
        return Err(ValidationError::invalid(
            "health_check_http.failure_threshold",
            0,
            "must be at least 1",
        ));
    }

    Ok(HealthCheckConfig {
        url,
        interval,
        timeout,
        failure_threshold,
    })
}

/// Split an argument string on whitespace, honoring single and double quotes.
fn split_args(line: &str) -> Result<Vec<String>, ValidationError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ValidationError::invalid("args", line, "unterminated quote"));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawArgs {
    List(Vec<Scalar>),
    Line(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawHealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_threshold: Option<u32>,
}

/// The document as written, before validation. Unknown keys are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawApp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<RawArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<BTreeMap<String, Scalar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instances: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exec_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    out_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_date_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    autorestart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    watch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_memory_restart: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_uptime: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_restarts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kill_timeout: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    listen_timeout: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    restart_delay: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    health_check_http: Option<RawHealthCheck>,
}

impl From<&ProcessDescriptor> for RawApp {
    fn from(d: &ProcessDescriptor) -> Self {
        let instances = match d.instance_count {
            InstanceCount::Fixed(n) => Scalar::Int(i64::from(n)),
            InstanceCount::PerCore => Scalar::Str("max".to_string()),
            InstanceCount::PerCoreMinus(n) => Scalar::Int(-i64::from(n)),
        };
        RawApp {
            name: Some(d.name.clone()),
            script: Some(d.command.clone()),
            args: Some(RawArgs::List(
                d.arguments.iter().cloned().map(Scalar::Str).collect(),
            )),
            cwd: Some(d.working_directory.clone()),
            env: Some(
                d.environment
                    .iter()
                    .map(|(k, v)| (k.clone(), Scalar::Str(v.clone())))
                    .collect(),
            ),
            instances: Some(instances),
            exec_mode: Some(d.execution_mode.as_str().to_string()),
            log_file: Some(d.log_paths.combined.clone()),
            out_file: Some(d.log_paths.out.clone()),
            error_file: Some(d.log_paths.error.clone()),
            log_date_format: Some(d.log_timestamp_format.clone()),
            autorestart: Some(d.auto_restart),
            watch: Some(d.watch_filesystem),
            max_memory_restart: d
                .max_memory_bytes
                .map(|b| Scalar::Int(i64::try_from(b).unwrap_or(i64::MAX))),
            min_uptime: Some(millis(d.min_uptime)),
            max_restarts: Some(i64::from(d.max_restart_attempts)),
            kill_timeout: Some(millis(d.kill_timeout)),
            wait_ready: Some(d.wait_for_ready_signal),
            listen_timeout: Some(millis(d.listen_timeout)),
            restart_delay: Some(millis(d.restart_delay)),
            health_check_http: d.health_check.as_ref().map(|hc| RawHealthCheck {
                url: Some(hc.url.clone()),
                interval: Some(millis(hc.interval)),
                timeout: Some(millis(hc.timeout)),
                failure_threshold: Some(hc.failure_threshold),
            }),
        }
    }
}
