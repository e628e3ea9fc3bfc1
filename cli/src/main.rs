// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use convertd_engine::chromium::Chromium;
use convertd_engine::config::{self, EngineConfig};
use convertd_engine::libreoffice::LibreOffice;
use convertd_engine::supervisor::{ManagedProcess, ProcessSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "convertd", about = "Supervisor daemon for document-to-PDF conversion engines")]
struct Args {
    /// Path to the service configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    info!("convertd starting (version {})", env!("CARGO_PKG_VERSION"));

    let path = args.config.unwrap_or_else(config::config_path);
    let config = config::load_config(&path)?;

    let mut supervisors: Vec<(&str, ProcessSupervisor, bool)> = Vec::new();

    if let Some(ref engine) = config.chromium {
        let process: Arc<dyn ManagedProcess> =
            Arc::new(Chromium::new(&engine.bin_path, engine.start_timeout()));
        supervisors.push(("chromium", build_supervisor(process, engine).await?, engine.auto_start));
    }
    if let Some(ref engine) = config.libreoffice {
        let process: Arc<dyn ManagedProcess> =
            Arc::new(LibreOffice::new(&engine.bin_path, engine.start_timeout()));
        supervisors.push((
            "libreoffice",
            build_supervisor(process, engine).await?,
            engine.auto_start,
        ));
    }

    if supervisors.is_empty() {
        info!("no engines configured, nothing to supervise");
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("convertd shutting down");

    for (name, supervisor, launched) in &supervisors {
        if !launched {
            continue;
        }
        info!(engine = name, "stopping engine");
        if let Err(err) = supervisor.shutdown().await {
            error!(engine = name, error = %err, "stop engine");
        }
    }

    Ok(())
}

async fn build_supervisor(
    process: Arc<dyn ManagedProcess>,
    engine: &EngineConfig,
) -> Result<ProcessSupervisor> {
    let supervisor = ProcessSupervisor::new(process, engine.restart_after, engine.max_queue_size);
    if engine.auto_start {
        supervisor.launch().await.context("launch engine")?;
    }
    Ok(supervisor)
}
