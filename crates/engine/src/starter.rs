// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Start coordination: launch, deadline-bounded wait-for-ready, stop.
//!
//! Concurrent starts of one emulator collapse onto a single child: the
//! first caller transitions the record to STARTING and launches, later
//! callers join the same readiness signal and receive the same outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use broker_core::{BrokerError, EmulatorId, StartCommand};

use crate::command;
use crate::launcher::{ChildProcess, LaunchSpec, ProcessLauncher, BROKER_ADDRESS_ENV};
use crate::ports::PortPicker;
use crate::readiness::{ReadinessWaiter, StartOutcome};
use crate::registry::{Attach, Registry, StartPlan};

/// How long a stopped child may linger after the interrupt before it is
/// force-terminated.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Launches emulator children and coordinates their readiness.
pub struct Starter {
    registry: Arc<Registry>,
    picker: Arc<PortPicker>,
    launcher: Arc<dyn ProcessLauncher>,
    broker_address: String,
    broker_dir: PathBuf,
    default_deadline: Option<Duration>,
}

impl Starter {
    pub fn new(
        registry: Arc<Registry>,
        picker: Arc<PortPicker>,
        launcher: Arc<dyn ProcessLauncher>,
        broker_address: String,
        broker_dir: PathBuf,
        default_deadline: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            picker,
            launcher,
            broker_address,
            broker_dir,
            default_deadline,
        }
    }

    /// Drive an emulator to ONLINE, bounded by the lesser of the caller
    /// deadline and the configured default.
    ///
    /// Joins an in-flight start when one exists. Errors: `NotFound`,
    /// `AlreadyExists` (already online), `Aborted` (launch failed or
    /// child exited early), `DeadlineExceeded`.
    pub async fn start(
        &self,
        id: &EmulatorId,
        caller_deadline: Option<Instant>,
    ) -> Result<(), BrokerError> {
        let plan = self
            .registry
            .begin_start(id, caller_deadline, self.default_deadline)?;

        let (waiter, deadline) = match plan {
            StartPlan::Join { waiter, deadline } => {
                debug!(emulator = %id, "joining start already in flight");
                (waiter, deadline)
            }
            StartPlan::Launch {
                cycle,
                command,
                waiter,
                deadline,
            } => {
                if let Err(e) = self.launch(id, cycle, &command).await {
                    // Internal detail is logged verbatim; the caller
                    // sees the start as aborted.
                    error!(emulator = %id, error = %e, "start failed before the child was running");
                    let aborted =
                        BrokerError::Aborted(format!("start of emulator {id} failed: {e}"));
                    self.registry.fail_start(id, cycle, aborted.clone());
                    return Err(aborted);
                }
                (waiter, deadline)
            }
        };

        self.wait_ready(id, waiter, deadline).await
    }

    /// Expand the command, spawn the child, and attach it to the record.
    async fn launch(
        &self,
        id: &EmulatorId,
        cycle: u64,
        command: &StartCommand,
    ) -> Result<(), BrokerError> {
        let expanded = command::expand(command, &self.picker, &self.broker_dir)?;

        let spec = LaunchSpec {
            path: expanded.path.clone(),
            args: expanded.args.clone(),
            env: vec![(BROKER_ADDRESS_ENV.to_string(), self.broker_address.clone())],
            log_tag: id.to_string(),
        };
        debug!(emulator = %id, path = %spec.path, "spawning emulator child");

        let child: Arc<dyn ChildProcess> = match self.launcher.launch(spec).await {
            Ok(child) => Arc::from(child),
            Err(e) => {
                for port in expanded.ports.values() {
                    self.picker.release(*port);
                }
                return Err(BrokerError::Internal(format!("spawn failed: {e}")));
            }
        };

        match self
            .registry
            .attach_child(id, cycle, Arc::clone(&child), expanded.clone())
        {
            Attach::Attached => {
                self.spawn_exit_watcher(id.clone(), cycle, &child);
                Ok(())
            }
            Attach::Stale => {
                // The start was stopped while we were spawning; the
                // record never saw this child or its ports.
                child.interrupt();
                for port in expanded.ports.values() {
                    self.picker.release(*port);
                }
                Err(BrokerError::Internal(
                    "emulator was stopped while its child was spawning".to_string(),
                ))
            }
        }
    }

    /// Observe the child's exit in the background: a child dying while
    /// STARTING aborts the start; one dying while ONLINE takes the
    /// emulator OFFLINE.
    fn spawn_exit_watcher(&self, id: EmulatorId, cycle: u64, child: &Arc<dyn ChildProcess>) {
        let registry = Arc::clone(&self.registry);
        let mut exited = child.exited();
        tokio::spawn(async move {
            loop {
                if let Some(code) = *exited.borrow_and_update() {
                    registry.on_child_exit(&id, cycle, Some(code));
                    return;
                }
                if exited.changed().await.is_err() {
                    registry.on_child_exit(&id, cycle, None);
                    return;
                }
            }
        });
    }

    /// Wait for the readiness signal, bounded by the deadline.
    async fn wait_ready(
        &self,
        id: &EmulatorId,
        waiter: ReadinessWaiter,
        deadline: Option<Instant>,
    ) -> Result<(), BrokerError> {
        let outcome = match deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, waiter.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(emulator = %id, "start deadline elapsed");
                        if let Some(child) = self.registry.deadline_expired(id) {
                            Self::spawn_terminate(child);
                        }
                        return Err(BrokerError::DeadlineExceeded(format!(
                            "emulator {id} did not report online before its deadline"
                        )));
                    }
                }
            }
            None => waiter.wait().await,
        };

        match outcome {
            StartOutcome::Online => Ok(()),
            StartOutcome::Failed(e) => Err(e),
        }
    }

    /// Stop an emulator. Success no-op when OFFLINE; otherwise the child
    /// is interrupted, given [`STOP_GRACE`], and force-terminated if it
    /// survives. Ports are released and the resolved host cleared.
    pub async fn stop(&self, id: &EmulatorId) -> Result<(), BrokerError> {
        let child = self.registry.begin_stop(id)?;
        if let Some(child) = child {
            terminate(child).await;
        }
        Ok(())
    }

    fn spawn_terminate(child: Arc<dyn ChildProcess>) {
        tokio::spawn(async move {
            terminate(child).await;
        });
    }
}

/// Interrupt a child, wait [`STOP_GRACE`], and kill it if still alive.
async fn terminate(child: Arc<dyn ChildProcess>) {
    child.interrupt();
    let mut exited = child.exited();
    let outcome = tokio::time::timeout(STOP_GRACE, exited.wait_for(|c| c.is_some())).await;
    if outcome.is_err() {
        warn!(pid = child.pid(), "child survived the interrupt, killing");
        child.kill();
    }
}

#[cfg(test)]
#[path = "starter_tests.rs"]
mod tests;
