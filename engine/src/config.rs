// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/convertd/convertd.yaml";

fn default_start_timeout_secs() -> u64 {
    20
}

/// Service configuration. An engine is supervised only when its section is
/// present.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub chromium: Option<EngineConfig>,
    pub libreoffice: Option<EngineConfig>,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    pub bin_path: String,
    /// Launch the engine when the daemon starts instead of on first use.
    #[serde(default)]
    pub auto_start: bool,
    /// Recycle the engine after this many handled requests. 0 disables
    /// recycling.
    #[serde(default)]
    pub restart_after: i64,
    /// Reject new work once this many callers are waiting. 0 means
    /// unbounded.
    #[serde(default)]
    pub max_queue_size: i64,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

impl EngineConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("CONVERTD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
