// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process supervision for external document-conversion engines.
//!
//! The conversion work itself is delegated to long-lived external processes
//! (a headless browser, an office-document listener). This crate owns the
//! hard part: spawning those processes in their own process group so the
//! whole tree can be torn down without orphans ([`cmd::Cmd`]), and mediating
//! concurrent, deadline-bound access to a single engine instance with
//! admission control, health-triggered recovery and usage-triggered
//! recycling ([`supervisor::ProcessSupervisor`]).

pub mod chromium;
pub mod cmd;
pub mod config;
mod freeport;
pub mod libreoffice;
pub mod supervisor;

pub use cmd::{Cmd, CmdError};
pub use supervisor::{ManagedProcess, ProcessSupervisor, SupervisorError};
