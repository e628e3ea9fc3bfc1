// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::cmd::Cmd;
use crate::freeport;
use crate::supervisor::ManagedProcess;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The headless browser engine. Owns one detached [`Cmd`]; the supervisor
/// drives start/stop/healthy, and renderer tasks talk to the devtools port.
pub struct Chromium {
    bin_path: String,
    start_timeout: Duration,
    state: Mutex<Option<Browser>>,
}

struct Browser {
    cmd: Cmd,
    port: u16,
    user_data_dir: PathBuf,
}

impl Chromium {
    pub fn new(bin_path: impl Into<String>, start_timeout: Duration) -> Self {
        Self {
            bin_path: bin_path.into(),
            start_timeout,
            state: Mutex::new(None),
        }
    }

    /// Devtools debugging port of the running browser, if any.
    pub async fn devtools_port(&self) -> Option<u16> {
        self.state.lock().await.as_ref().map(|browser| browser.port)
    }
}

fn browser_args(port: u16, user_data_dir: &Path) -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--disable-translate".to_string(),
        "--disable-extensions".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--disable-default-apps".to_string(),
        "--safebrowsing-disable-auto-update".to_string(),
        // Inconsistent font rendering otherwise.
        "--font-render-hinting=none".to_string(),
        "--hide-scrollbars".to_string(),
        "--metrics-recording-only".to_string(),
        "--mute-audio".to_string(),
        "--no-first-run".to_string(),
        format!("--user-data-dir={}", user_data_dir.display()),
        format!("--remote-debugging-port={port}"),
    ]
}

/// Probe the devtools version endpoint. The browser answers on it only once
/// it is actually able to accept new sessions.
async fn devtools_answers(port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{port}/json/version");
    let probe = tokio::task::spawn_blocking(move || {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        match agent.get(&url).call() {
            Ok(response) => response.status() == 200,
            Err(_) => false,
        }
    });

    probe.await.unwrap_or(false)
}

#[async_trait]
impl ManagedProcess for Chromium {
    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            bail!("browser is already started");
        }

        let port = freeport::free_port().context("allocate a devtools port")?;
        let user_data_dir = std::env::temp_dir().join(format!("convertd-chromium-{port}"));
        std::fs::create_dir_all(&user_data_dir).context("create the user data directory")?;

        let mut cmd = Cmd::new(&self.bin_path, browser_args(port, &user_data_dir));
        cmd.start().context("start the browser")?;

        // The devtools endpoint lags behind the process; do not report the
        // browser as started until it answers.
        let deadline = Instant::now() + self.start_timeout;
        loop {
            if devtools_answers(port, PROBE_TIMEOUT).await {
                break;
            }
            if Instant::now() >= deadline {
                if let Err(err) = cmd.kill() {
                    warn!(error = %err, "kill the browser after a failed start");
                }
                bail!(
                    "browser devtools endpoint not ready after {:?}",
                    self.start_timeout
                );
            }
            sleep(READINESS_POLL_INTERVAL).await;
        }

        debug!(port, "browser ready");
        *state = Some(Browser {
            cmd,
            port,
            user_data_dir,
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut browser) = self.state.lock().await.take() else {
            bail!("browser is already stopped");
        };

        browser.cmd.kill().context("kill the browser process")?;
        if let Err(err) = browser.cmd.wait().await {
            debug!(error = %err, "wait for the browser");
        }

        if let Err(err) = std::fs::remove_dir_all(&browser.user_data_dir) {
            warn!(error = %err, "remove the browser user data directory");
        }

        Ok(())
    }

    async fn healthy(&self) -> bool {
        let port = match self.state.lock().await.as_ref() {
            Some(browser) => browser.port,
            None => return false,
        };

        devtools_answers(port, PROBE_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_args_wire_the_devtools_port() {
        let args = browser_args(9222, Path::new("/tmp/profile"));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--headless".to_string()));
    }

    #[tokio::test]
    async fn test_stopped_browser_is_not_healthy() {
        let chromium = Chromium::new("/usr/bin/chromium", Duration::from_secs(10));
        assert!(!chromium.healthy().await);
        assert!(chromium.devtools_port().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let chromium = Chromium::new("/usr/bin/chromium", Duration::from_secs(10));
        assert!(chromium.stop().await.is_err());
    }
}
