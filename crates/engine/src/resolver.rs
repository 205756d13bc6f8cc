// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Target resolution: rule matching, on-demand starts, rewriting.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use broker_core::{target, BrokerError, EmulatorState};

use crate::readiness::StartOutcome;
use crate::registry::Registry;
use crate::starter::Starter;

/// Outcome of a resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The (possibly rewritten) target.
    pub target: String,
    pub requires_secure_connection: bool,
}

/// Matches targets against the rule table and drives on-demand starts.
pub struct Resolver {
    registry: Arc<Registry>,
    starter: Arc<Starter>,
}

impl Resolver {
    pub fn new(registry: Arc<Registry>, starter: Arc<Starter>) -> Self {
        Self { registry, starter }
    }

    /// Resolve a target within the caller's deadline.
    ///
    /// A target with no matching rule is echoed back unchanged. A match
    /// whose owning emulator is OFFLINE with `start_on_demand` starts it
    /// here; one that is STARTING is joined. Any failure to produce a
    /// resolved host is `Unavailable`.
    pub async fn resolve(
        &self,
        target: &str,
        caller_deadline: Option<Instant>,
    ) -> Result<Resolution, BrokerError> {
        let Some(matched) = self.registry.match_target(target) else {
            return Ok(Resolution {
                target: target.to_string(),
                requires_secure_connection: false,
            });
        };

        if let Some(owner) = matched.owner {
            let id = owner.emulator_id;
            match owner.state {
                EmulatorState::Offline if owner.start_on_demand => {
                    debug!(emulator = %id, resolve_target = target, "resolve starts emulator on demand");
                    match self.starter.start(&id, caller_deadline).await {
                        Ok(()) => {}
                        // Another caller raced it to online.
                        Err(BrokerError::AlreadyExists(_)) => {}
                        Err(e) => {
                            return Err(BrokerError::Unavailable(format!(
                                "on-demand start of emulator {id} failed: {e}"
                            )));
                        }
                    }
                }
                EmulatorState::Offline => {}
                EmulatorState::Starting => {
                    let Some(waiter) = owner.waiter else {
                        return Err(BrokerError::Unavailable(format!(
                            "emulator {id} is starting without a readiness signal"
                        )));
                    };
                    let outcome = match caller_deadline {
                        Some(deadline) => {
                            let deadline = tokio::time::Instant::from_std(deadline);
                            tokio::time::timeout_at(deadline, waiter.wait())
                                .await
                                .map_err(|_| {
                                    BrokerError::Unavailable(format!(
                                        "timed out waiting for emulator {id} to come online"
                                    ))
                                })?
                        }
                        None => waiter.wait().await,
                    };
                    match outcome {
                        StartOutcome::Online => {}
                        StartOutcome::Failed(e) => {
                            return Err(BrokerError::Unavailable(format!(
                                "emulator {id} failed to come online: {e}"
                            )));
                        }
                    }
                }
                EmulatorState::Online => {}
            }
        }

        let (resolved_host, requires_secure) = self
            .registry
            .rule_host(&matched.rule_id)
            .ok_or_else(|| BrokerError::Unavailable(format!("rule {} vanished", matched.rule_id)))?;
        if resolved_host.is_empty() {
            return Err(BrokerError::Unavailable(format!(
                "rule {} has no resolved host",
                matched.rule_id
            )));
        }

        Ok(Resolution {
            target: target::rewrite(target, &resolved_host, requires_secure),
            requires_secure_connection: requires_secure,
        })
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
