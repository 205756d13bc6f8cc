// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot readiness broadcast for emulator starts.
//!
//! Armed on each OFFLINE → STARTING transition and fired exactly once
//! per start cycle: either the emulator reported online or the start
//! concluded with an error. The first writer wins; every waiter,
//! including late subscribers, observes the same outcome.

use broker_core::BrokerError;
use tokio::sync::watch;

/// How a start cycle concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The emulator reported online.
    Online,
    /// The start concluded with an error (deadline, child exit, stop).
    Failed(BrokerError),
}

/// The sending half, owned by the emulator record.
#[derive(Debug)]
pub struct Readiness {
    tx: watch::Sender<Option<StartOutcome>>,
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Fire the signal. Returns false if it was already fired; the
    /// losing writer must treat that as a no-op.
    pub fn fire(&self, outcome: StartOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    /// Subscribe a waiter. May be called before or after the fire.
    pub fn subscribe(&self) -> ReadinessWaiter {
        ReadinessWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

/// A waiter on one start cycle's outcome.
#[derive(Debug)]
pub struct ReadinessWaiter {
    rx: watch::Receiver<Option<StartOutcome>>,
}

impl ReadinessWaiter {
    /// Wait until the signal fires. If the record is dropped before the
    /// signal fires, the start counts as aborted.
    pub async fn wait(mut self) -> StartOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return StartOutcome::Failed(BrokerError::Aborted(
                    "emulator removed while starting".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "readiness_tests.rs"]
mod tests;
