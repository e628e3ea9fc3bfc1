// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error};

/// Exit code reported when `exec` is invoked on a detached command.
pub const EXIT_CODE_MISSING_CONTEXT: i32 = 10;
/// Exit code reported when the cancellation context wins the wait race.
pub const EXIT_CODE_DEADLINE_EXCEEDED: i32 = 62;
/// Exit code reported when the real exit code cannot be determined, e.g.
/// when the process was terminated by a signal.
pub const EXIT_CODE_UNKNOWN: i32 = 131;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("cannot execute a detached command, no cancellation context is bound")]
    MissingContext,

    #[error("process has not been started")]
    NotStarted,

    #[error("pipe process output: {0}")]
    Pipe(#[source] io::Error),

    #[error("start process: {0}")]
    Start(#[source] io::Error),

    #[error("wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("process exited with code {code}")]
    Exit { code: i32 },

    #[error("deadline exceeded while waiting for process")]
    DeadlineExceeded,

    #[error("kill process group: {0}")]
    Kill(#[source] Errno),
}

impl CmdError {
    /// Exit code equivalent of the error, for callers that report one.
    pub fn exit_code(&self) -> i32 {
        match self {
            CmdError::MissingContext => EXIT_CODE_MISSING_CONTEXT,
            CmdError::DeadlineExceeded => EXIT_CODE_DEADLINE_EXCEEDED,
            CmdError::Exit { code } => *code,
            _ => EXIT_CODE_UNKNOWN,
        }
    }
}

/// One OS process placed in its own process group, so that the whole tree
/// can be torn down by signalling the negative group id. Killing only the
/// leader pid would orphan its children.
pub struct Cmd {
    ctx: Option<CancellationToken>,
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    pgid: Option<i32>,
}

impl Cmd {
    /// Detached command, for fire-and-forget daemons: no cancellation
    /// context is bound, and the caller drives `start`/`wait`/`kill`
    /// manually.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            ctx: None,
            program: program.into(),
            args,
            child: None,
            pgid: None,
        }
    }

    /// Command bound to a cancellation context; `exec` races the process
    /// against it.
    pub fn with_context(
        ctx: CancellationToken,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            ctx: Some(ctx),
            program: program.into(),
            args,
            child: None,
            pgid: None,
        }
    }

    /// Process group id, once the process has been started.
    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    /// Start the process without waiting for its completion. [`Cmd::wait`]
    /// must be called afterwards so the process does not linger as a zombie.
    ///
    /// stdout and stderr are forwarded to the logs only when debug logging
    /// is enabled; piping is not worth its cost otherwise.
    pub fn start(&mut self) -> Result<(), CmdError> {
        let pipe_output = tracing::enabled!(Level::DEBUG);

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.stdin(Stdio::null());
        if pipe_output {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }

        // Own process group, so kill() can signal the whole tree at once.
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!(program = %self.program, args = ?self.args, "starting process");

        let mut child = command.spawn().map_err(CmdError::Start)?;
        self.pgid = child.id().map(|pid| pid as i32);

        if pipe_output {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| CmdError::Pipe(io::Error::other("stdout handle missing")))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| CmdError::Pipe(io::Error::other("stderr handle missing")))?;
            forward_output("stdout", stdout);
            forward_output("stderr", stderr);
        }

        self.child = Some(child);

        Ok(())
    }

    /// Wait for the process to exit. Required after [`Cmd::start`] to reap
    /// the process.
    pub async fn wait(&mut self) -> Result<ExitStatus, CmdError> {
        let child = self.child.as_mut().ok_or(CmdError::NotStarted)?;
        child.wait().await.map_err(CmdError::Wait)
    }

    /// Start the process and wait for its completion or for the bound
    /// context to be cancelled. In either outcome the process group is
    /// killed afterwards, so no runaway children survive.
    ///
    /// Returns 0 on a clean exit. Error variants carry their exit code
    /// through [`CmdError::exit_code`].
    pub async fn exec(&mut self) -> Result<i32, CmdError> {
        let ctx = self.ctx.clone().ok_or(CmdError::MissingContext)?;

        self.start()?;

        let outcome = tokio::select! {
            status = self.wait() => Some(status),
            _ = ctx.cancelled() => None,
        };

        if let Err(err) = self.kill() {
            error!(error = %err, "kill process after execution");
        }

        match outcome {
            None => Err(CmdError::DeadlineExceeded),
            Some(Err(err)) => Err(err),
            Some(Ok(status)) if status.success() => Ok(0),
            Some(Ok(status)) => Err(CmdError::Exit {
                code: status.code().unwrap_or(EXIT_CODE_UNKNOWN),
            }),
        }
    }

    /// Kill the whole process group. Idempotent: a group that is already
    /// gone, or a command that was never started, is not an error.
    pub fn kill(&self) -> Result<(), CmdError> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };

        match signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => {
                debug!(pgid, "process group killed");
                Ok(())
            }
            // The process group does not exist anymore.
            Err(Errno::ESRCH) => {
                debug!(pgid, "process group already gone");
                Ok(())
            }
            Err(errno) => Err(CmdError::Kill(errno)),
        }
    }
}

fn forward_output<R>(stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                debug!(stream, "{line}");
            }
        }
    });
}
