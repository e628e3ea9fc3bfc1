// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::cmd::{Cmd, CmdError};
use crate::freeport;
use crate::supervisor::ManagedProcess;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code of the office binary's very first run, before it can act as a
/// daemon.
const FIRST_START_EXIT_CODE: i32 = 81;

/// The office-document converter engine: a `soffice` process accepting UNO
/// connections on a loopback URP socket. Owns one detached [`Cmd`]; the
/// supervisor drives start/stop/healthy, and converter tasks talk to the
/// socket.
pub struct LibreOffice {
    bin_path: String,
    start_timeout: Duration,
    state: Mutex<Option<Listener>>,
}

struct Listener {
    cmd: Cmd,
    port: u16,
    user_profile_dir: PathBuf,
}

impl LibreOffice {
    pub fn new(bin_path: impl Into<String>, start_timeout: Duration) -> Self {
        Self {
            bin_path: bin_path.into(),
            start_timeout,
            state: Mutex::new(None),
        }
    }

    /// URP socket port of the running listener, if any.
    pub async fn socket_port(&self) -> Option<u16> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|listener| listener.port)
    }
}

fn listener_args(port: u16, user_profile_dir: &Path) -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--invisible".to_string(),
        "--nocrashreport".to_string(),
        "--nodefault".to_string(),
        "--nologo".to_string(),
        "--nofirststartwizard".to_string(),
        "--norestore".to_string(),
        format!("-env:UserInstallation=file://{}", user_profile_dir.display()),
        format!(
            "--accept=socket,host=127.0.0.1,port={port},tcpNoDelay=1;urp;StarOffice.ComponentContext"
        ),
    ]
}

async fn socket_accepts(port: u16, probe_timeout: Duration) -> bool {
    matches!(
        timeout(probe_timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[async_trait]
impl ManagedProcess for LibreOffice {
    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            bail!("office listener is already started");
        }

        let port = freeport::free_port().context("allocate a socket port")?;
        let user_profile_dir = std::env::temp_dir().join(format!("convertd-libreoffice-{port}"));
        std::fs::create_dir_all(&user_profile_dir).context("create the user profile directory")?;

        // The office binary needs one run to initialise its profile before
        // it can act as a daemon; that run exits with code 81.
        let ctx = CancellationToken::new();
        let timer = ctx.clone();
        let start_timeout = self.start_timeout;
        tokio::spawn(async move {
            sleep(start_timeout).await;
            timer.cancel();
        });

        let mut first_start =
            Cmd::with_context(ctx, &self.bin_path, listener_args(port, &user_profile_dir));
        match first_start.exec().await {
            Ok(_) => {}
            Err(CmdError::Exit {
                code: FIRST_START_EXIT_CODE,
            }) => {
                debug!("office first start done");
            }
            Err(err) => return Err(err).context("execute the office first start"),
        }

        let mut cmd = Cmd::new(&self.bin_path, listener_args(port, &user_profile_dir));
        cmd.start().context("start the office listener")?;

        // The URP socket can take a while to accept connections.
        let deadline = Instant::now() + self.start_timeout;
        loop {
            if socket_accepts(port, PROBE_TIMEOUT).await {
                break;
            }
            if Instant::now() >= deadline {
                if let Err(err) = cmd.kill() {
                    warn!(error = %err, "kill the office listener after a failed start");
                }
                bail!(
                    "office listener socket not ready after {:?}",
                    self.start_timeout
                );
            }
            sleep(READINESS_POLL_INTERVAL).await;
        }

        debug!(port, "office listener ready");
        *state = Some(Listener {
            cmd,
            port,
            user_profile_dir,
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut listener) = self.state.lock().await.take() else {
            bail!("office listener is already stopped");
        };

        listener.cmd.kill().context("kill the office listener")?;
        if let Err(err) = listener.cmd.wait().await {
            debug!(error = %err, "wait for the office listener");
        }

        if let Err(err) = std::fs::remove_dir_all(&listener.user_profile_dir) {
            warn!(error = %err, "remove the office user profile directory");
        }

        Ok(())
    }

    async fn healthy(&self) -> bool {
        let port = match self.state.lock().await.as_ref() {
            Some(listener) => listener.port,
            None => return false,
        };

        socket_accepts(port, PROBE_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_args_wire_the_urp_socket() {
        let args = listener_args(2002, Path::new("/tmp/profile"));
        assert!(args.contains(
            &"--accept=socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp;StarOffice.ComponentContext"
                .to_string()
        ));
        assert!(args.contains(&"-env:UserInstallation=file:///tmp/profile".to_string()));
        assert!(args.contains(&"--headless".to_string()));
    }

    #[tokio::test]
    async fn test_stopped_listener_is_not_healthy() {
        let office = LibreOffice::new("/usr/bin/soffice", Duration::from_secs(10));
        assert!(!office.healthy().await);
        assert!(office.socket_port().await.is_none());
    }

    #[tokio::test]
    async fn test_socket_probe_accepts_a_live_listener() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(socket_accepts(port, PROBE_TIMEOUT).await);
        drop(listener);
        assert!(!socket_accepts(port, PROBE_TIMEOUT).await);
    }
}
