// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! End-to-end supervision over real OS processes. The managed process here
//! is a plain `/bin/sleep` daemon, which keeps the tests runnable on any
//! unix box while still exercising spawn, group kill and reaping for real.

use async_trait::async_trait;
use convertd_engine::cmd::Cmd;
use convertd_engine::supervisor::{ManagedProcess, ProcessSupervisor};
use nix::sys::signal;
use nix::unistd::Pid;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct SleeperProcess {
    alive: AtomicBool,
    state: Mutex<Option<Cmd>>,
}

impl SleeperProcess {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            state: Mutex::new(None),
        })
    }

    async fn pid(&self) -> Option<i32> {
        self.state.lock().await.as_ref().and_then(|cmd| cmd.pgid())
    }
}

#[async_trait]
impl ManagedProcess for SleeperProcess {
    async fn start(&self) -> anyhow::Result<()> {
        let mut cmd = Cmd::new("/bin/sleep", vec!["300".into()]);
        cmd.start()?;
        *self.state.lock().await = Some(cmd);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(mut cmd) = self.state.lock().await.take() {
            cmd.kill()?;
            let _ = cmd.wait().await;
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn pid_is_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

fn wait_for_pid_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

async fn run_noop(supervisor: &ProcessSupervisor) {
    supervisor
        .run(&CancellationToken::new(), async { anyhow::Ok(()) })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_first_run_spawns_the_process() {
    let process = SleeperProcess::new();
    let supervisor = ProcessSupervisor::new(process.clone(), 0, 0);

    run_noop(&supervisor).await;

    let pid = process.pid().await.expect("process should be running");
    assert!(pid_is_alive(pid), "managed process should be alive");

    supervisor.shutdown().await.unwrap();
    assert!(
        wait_for_pid_gone(pid, Duration::from_secs(5)),
        "managed process should be gone after shutdown"
    );
}

#[tokio::test]
async fn test_recycling_replaces_the_os_process() {
    let process = SleeperProcess::new();
    let supervisor = ProcessSupervisor::new(process.clone(), 1, 0);

    run_noop(&supervisor).await;
    let first_pid = process.pid().await.unwrap();

    // The second request exceeds the limit: the supervisor must hand it a
    // fresh process.
    run_noop(&supervisor).await;
    let second_pid = process.pid().await.unwrap();

    assert_ne!(first_pid, second_pid, "expected a fresh process");
    assert_eq!(supervisor.restarts_count(), 1);
    assert!(
        wait_for_pid_gone(first_pid, Duration::from_secs(5)),
        "recycled process should be gone"
    );
    assert!(pid_is_alive(second_pid));

    supervisor.shutdown().await.unwrap();
    assert!(wait_for_pid_gone(second_pid, Duration::from_secs(5)));
}

#[tokio::test]
async fn test_unhealthy_process_is_replaced() {
    let process = SleeperProcess::new();
    let supervisor = ProcessSupervisor::new(process.clone(), 0, 0);

    run_noop(&supervisor).await;
    let first_pid = process.pid().await.unwrap();

    process.alive.store(false, Ordering::SeqCst);
    run_noop(&supervisor).await;
    let second_pid = process.pid().await.unwrap();

    assert_ne!(first_pid, second_pid);
    assert_eq!(supervisor.restarts_count(), 1);
    assert!(wait_for_pid_gone(first_pid, Duration::from_secs(5)));

    supervisor.shutdown().await.unwrap();
    assert!(wait_for_pid_gone(second_pid, Duration::from_secs(5)));
}

#[tokio::test]
async fn test_explicit_launch_then_shutdown() {
    let process = SleeperProcess::new();
    let supervisor = ProcessSupervisor::new(process.clone(), 0, 0);

    supervisor.launch().await.unwrap();
    let pid = process.pid().await.unwrap();
    assert!(pid_is_alive(pid));
    assert!(supervisor.healthy().await);

    supervisor.shutdown().await.unwrap();
    assert!(
        wait_for_pid_gone(pid, Duration::from_secs(5)),
        "no child may outlive the supervisor shutdown"
    );
}
