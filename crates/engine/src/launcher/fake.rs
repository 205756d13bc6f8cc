// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake launcher for lifecycle tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{ChildProcess, LaunchError, LaunchSpec, ProcessLauncher};

/// Test handle to a fake child: inspect the launch, count signals, and
/// drive the exit from the test.
#[derive(Clone)]
pub struct FakeChildHandle {
    pub pid: u32,
    pub spec: LaunchSpec,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    interrupts: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl FakeChildHandle {
    /// Make the fake child exit with `code`.
    pub fn exit(&self, code: i32) {
        let _ = self.exit_tx.send(Some(code));
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

/// In-memory launcher: records launch specs and hands out controllable
/// children. By default a fake child "dies" when interrupted or killed,
/// like a well-behaved emulator.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    children: Vec<FakeChildHandle>,
    fail_next: bool,
    ignore_signals: bool,
    next_pid: u32,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next launch fail with a spawn error.
    pub fn fail_next(&self) {
        self.inner.lock().fail_next = true;
    }

    /// Fake children stay alive through interrupt/kill (for testing the
    /// force-terminate escalation).
    pub fn ignore_signals(&self) {
        self.inner.lock().ignore_signals = true;
    }

    pub fn launch_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    pub fn children(&self) -> Vec<FakeChildHandle> {
        self.inner.lock().children.clone()
    }

    /// Wait until `n` launches have happened.
    pub async fn wait_for_launches(&self, n: usize) -> Vec<FakeChildHandle> {
        loop {
            {
                let inner = self.inner.lock();
                if inner.children.len() >= n {
                    return inner.children.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn ChildProcess>, LaunchError> {
        let mut inner = self.inner.lock();
        if inner.fail_next {
            inner.fail_next = false;
            return Err(LaunchError::Spawn(std::io::Error::other(
                "fake spawn failure",
            )));
        }

        inner.next_pid += 1;
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = FakeChildHandle {
            pid: inner.next_pid,
            spec,
            exit_tx: Arc::new(exit_tx),
            interrupts: Arc::new(AtomicUsize::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
        };
        inner.children.push(handle.clone());

        Ok(Box::new(FakeChild {
            handle,
            exited: exit_rx,
            ignore_signals: inner.ignore_signals,
        }))
    }
}

struct FakeChild {
    handle: FakeChildHandle,
    exited: watch::Receiver<Option<i32>>,
    ignore_signals: bool,
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.handle.pid
    }

    fn exited(&self) -> watch::Receiver<Option<i32>> {
        self.exited.clone()
    }

    fn interrupt(&self) {
        self.handle.interrupts.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_signals {
            self.handle.exit(130);
        }
    }

    fn kill(&self) {
        self.handle.kills.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_signals {
            self.handle.exit(137);
        }
    }
}
