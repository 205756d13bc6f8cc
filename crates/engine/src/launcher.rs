// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process launching adapters.
//!
//! The launcher is the fork-exec + stdio-piping primitive behind a
//! trait so lifecycle code can be exercised with a fake. Children get
//! [`BROKER_ADDRESS_ENV`] in their environment and are expected to call
//! back with `ReportEmulatorOnline` once ready. Child stdout/stderr are
//! read by dedicated tasks, prefixed with the emulator id, and emitted
//! to the broker log; readers terminate on stream EOF.

use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tracing::{debug, info};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeChildHandle, FakeLauncher};

/// Environment variable naming the broker's RPC endpoint in children.
pub const BROKER_ADDRESS_ENV: &str = "TESTENV_BROKER_ADDRESS";

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Prefix for logged stdout/stderr lines (the emulator id).
    pub log_tag: String,
}

/// Errors from spawning a child.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("child reported no pid")]
    NoPid,
}

/// A running child process.
pub trait ChildProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Publishes the exit code once the child terminates (`-1` when the
    /// child died to a signal).
    fn exited(&self) -> watch::Receiver<Option<i32>>;

    /// Graceful interrupt (SIGINT).
    fn interrupt(&self);

    /// Force termination (SIGKILL).
    fn kill(&self);
}

/// Spawns emulator child processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn ChildProcess>, LaunchError>;
}

/// Production launcher backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn ChildProcess>, LaunchError> {
        let mut command = tokio::process::Command::new(&spec.path);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let pid = child.id().ok_or(LaunchError::NoPid)?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(spec.log_tag.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(spec.log_tag.clone(), "stderr", stderr);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    debug!(pid, error = %e, "wait on child failed");
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(Box::new(TokioChild {
            pid,
            exited: exit_rx,
        }))
    }
}

struct TokioChild {
    pid: u32,
    exited: watch::Receiver<Option<i32>>,
}

impl ChildProcess for TokioChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn exited(&self) -> watch::Receiver<Option<i32>> {
        self.exited.clone()
    }

    fn interrupt(&self) {
        deliver(self.pid, Signal::SIGINT);
    }

    fn kill(&self) {
        deliver(self.pid, Signal::SIGKILL);
    }
}

fn deliver(pid: u32, signal: Signal) {
    if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        // Usually means the child is already gone.
        debug!(pid, signal = %signal, error = %e, "signal delivery failed");
    }
}

/// Forward one child stream to the broker log, one line at a time,
/// prefixed with the emulator id. Terminates on EOF.
fn spawn_line_pump(
    tag: String,
    stream: &'static str,
    reader: impl AsyncRead + Send + Unpin + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(emulator = %tag, stream, "{line}");
        }
    });
}

#[cfg(test)]
#[path = "launcher_tests.rs"]
mod tests;
