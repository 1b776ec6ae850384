// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process supervision driven by PM2-style process descriptors.

pub mod crashloop;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod instance;
pub mod logs;
pub mod memory;
pub mod policy;
pub mod process;
pub mod readiness;
pub mod settings;
pub mod state;
pub mod supervisor;
pub mod timefmt;
pub mod units;
pub mod watch;

pub use descriptor::{ProcessDescriptor, load, load_all, load_file};
pub use error::{LaunchError, SupervisorError, ValidationError};
pub use instance::InstanceStatus;
pub use settings::Settings;
pub use state::ProcessState;
pub use supervisor::Supervisor;
