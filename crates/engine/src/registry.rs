// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Central broker state: emulators, resolve rules, and proxies.
//!
//! One mutex guards map membership and record transitions. It is never
//! held across a spawn, a wait, or network I/O; long waits happen on
//! the record's readiness signal outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use broker_core::{
    compile_patterns, BrokerError, EmulatorId, EmulatorSpec, EmulatorState, ResolveRule, RuleId,
    StartCommand,
};

use crate::command::ExpandedCommand;
use crate::launcher::ChildProcess;
use crate::ports::PortPicker;
use crate::readiness::{Readiness, ReadinessWaiter, StartOutcome};
use crate::record::EmulatorRecord;

/// A rule with its compiled patterns and (optional) owning emulator.
pub(crate) struct RuleEntry {
    pub rule: ResolveRule,
    pub compiled: Vec<Regex>,
    pub owner: Option<EmulatorId>,
}

/// A proxy slot: reserved while its listener binds, then active.
pub(crate) enum ProxySlot {
    Reserved,
    Active(ProxyEntry),
}

pub(crate) struct ProxyEntry {
    pub port: u16,
    pub leased_from_picker: bool,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

struct Inner {
    emulators: HashMap<EmulatorId, EmulatorRecord>,
    rules: HashMap<RuleId, RuleEntry>,
    proxies: HashMap<EmulatorId, ProxySlot>,
}

/// The registry owning all three maps.
pub struct Registry {
    inner: Mutex<Inner>,
    picker: Arc<PortPicker>,
}

/// Emulator state as returned by `GetEmulator`/`ListEmulators`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorView {
    pub emulator_id: EmulatorId,
    pub state: EmulatorState,
    /// The emulator's rule in its current state (resolved host, merged
    /// patterns).
    pub rule: ResolveRule,
    pub start_command: StartCommand,
    pub start_on_demand: bool,
    /// The expanded command line and port map of the most recent start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_command: Option<ExpandedCommand>,
}

/// Outcome of `begin_start` under the mutex.
pub(crate) enum StartPlan {
    /// Another caller is already starting this emulator; wait with it.
    Join {
        waiter: ReadinessWaiter,
        deadline: Option<Instant>,
    },
    /// This caller transitioned OFFLINE → STARTING and must launch.
    Launch {
        cycle: u64,
        command: StartCommand,
        waiter: ReadinessWaiter,
        deadline: Option<Instant>,
    },
}

pub(crate) enum Attach {
    Attached,
    /// The start cycle ended while the child was being spawned.
    Stale,
}

/// Result of matching a target against the rule table.
pub(crate) struct MatchedRule {
    pub rule_id: RuleId,
    pub owner: Option<OwnerSnapshot>,
}

/// Owning-emulator state captured under the mutex at match time.
pub(crate) struct OwnerSnapshot {
    pub emulator_id: EmulatorId,
    pub state: EmulatorState,
    pub start_on_demand: bool,
    /// Subscribed while the owner was starting.
    pub waiter: Option<ReadinessWaiter>,
}

impl Registry {
    pub fn new(picker: Arc<PortPicker>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                emulators: HashMap::new(),
                rules: HashMap::new(),
                proxies: HashMap::new(),
            }),
            picker,
        }
    }

    // ---------------------------------------------------------------
    // Emulator CRUD
    // ---------------------------------------------------------------

    pub fn create_emulator(&self, spec: EmulatorSpec) -> Result<(), BrokerError> {
        spec.validate()?;
        let compiled = compile_patterns(&spec.rule.target_patterns)?;

        let mut inner = self.inner.lock();
        if inner.emulators.contains_key(&spec.emulator_id) {
            return Err(BrokerError::AlreadyExists(format!(
                "emulator {}",
                spec.emulator_id
            )));
        }

        let rule_id = spec.rule.rule_id.clone();
        match inner.rules.get_mut(&rule_id) {
            Some(entry) => {
                if entry.rule != spec.rule {
                    return Err(BrokerError::AlreadyExists(format!(
                        "rule {rule_id} exists with a different definition"
                    )));
                }
                match &entry.owner {
                    Some(owner) => {
                        return Err(BrokerError::AlreadyExists(format!(
                            "rule {rule_id} is owned by emulator {owner}"
                        )));
                    }
                    None => entry.owner = Some(spec.emulator_id.clone()),
                }
            }
            None => {
                inner.rules.insert(
                    rule_id,
                    RuleEntry {
                        rule: spec.rule.clone(),
                        compiled,
                        owner: Some(spec.emulator_id.clone()),
                    },
                );
            }
        }

        info!(emulator = %spec.emulator_id, "emulator registered");
        inner
            .emulators
            .insert(spec.emulator_id.clone(), EmulatorRecord::new(spec));
        Ok(())
    }

    pub fn get_emulator(&self, id: &EmulatorId) -> Result<EmulatorView, BrokerError> {
        let inner = self.inner.lock();
        let rec = inner
            .emulators
            .get(id)
            .ok_or_else(|| BrokerError::NotFound(format!("emulator {id}")))?;
        Ok(Self::view_locked(&inner, rec))
    }

    pub fn list_emulators(&self) -> Vec<EmulatorView> {
        let inner = self.inner.lock();
        let mut views: Vec<EmulatorView> = inner
            .emulators
            .values()
            .map(|rec| Self::view_locked(&inner, rec))
            .collect();
        views.sort_by(|a, b| a.emulator_id.cmp(&b.emulator_id));
        views
    }

    pub fn emulator_ids(&self) -> Vec<EmulatorId> {
        let mut ids: Vec<EmulatorId> = self.inner.lock().emulators.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn view_locked(inner: &Inner, rec: &EmulatorRecord) -> EmulatorView {
        let rule = inner
            .rules
            .get(rec.rule_id())
            .map(|e| e.rule.clone())
            .unwrap_or_else(|| rec.spec.rule.clone());
        EmulatorView {
            emulator_id: rec.spec.emulator_id.clone(),
            state: rec.state,
            rule,
            start_command: rec.spec.start_command.clone(),
            start_on_demand: rec.spec.start_on_demand,
            expanded_command: rec.expanded.clone(),
        }
    }

    // ---------------------------------------------------------------
    // Rule CRUD
    // ---------------------------------------------------------------

    pub fn create_resolve_rule(&self, rule: ResolveRule) -> Result<(), BrokerError> {
        rule.rule_id.check()?;
        let compiled = compile_patterns(&rule.target_patterns)?;

        let mut inner = self.inner.lock();
        match inner.rules.get(&rule.rule_id) {
            // Re-creating an identical rule is a success no-op.
            Some(existing) if existing.rule == rule => Ok(()),
            Some(_) => Err(BrokerError::AlreadyExists(format!(
                "rule {} exists with a different definition",
                rule.rule_id
            ))),
            None => {
                info!(rule = %rule.rule_id, "resolve rule registered");
                inner.rules.insert(
                    rule.rule_id.clone(),
                    RuleEntry {
                        rule,
                        compiled,
                        owner: None,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn get_resolve_rule(&self, id: &RuleId) -> Result<ResolveRule, BrokerError> {
        self.inner
            .lock()
            .rules
            .get(id)
            .map(|e| e.rule.clone())
            .ok_or_else(|| BrokerError::NotFound(format!("rule {id}")))
    }

    /// Merge `update.target_patterns` into the stored set and overwrite
    /// the scalar fields.
    pub fn update_resolve_rule(&self, update: ResolveRule) -> Result<(), BrokerError> {
        update.rule_id.check()?;
        let new_compiled = compile_patterns(&update.target_patterns)?;

        let mut inner = self.inner.lock();
        let entry = inner
            .rules
            .get_mut(&update.rule_id)
            .ok_or_else(|| BrokerError::NotFound(format!("rule {}", update.rule_id)))?;

        for (pattern, regex) in update.target_patterns.iter().zip(new_compiled) {
            if entry.rule.target_patterns.insert(pattern.clone()) {
                entry.compiled.push(regex);
            }
        }
        entry.rule.resolved_host = update.resolved_host;
        entry.rule.requires_secure_connection = update.requires_secure_connection;
        Ok(())
    }

    pub fn list_resolve_rules(&self) -> Vec<ResolveRule> {
        let inner = self.inner.lock();
        let mut rules: Vec<ResolveRule> = inner.rules.values().map(|e| e.rule.clone()).collect();
        rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        rules
    }

    // ---------------------------------------------------------------
    // Lifecycle transitions (called by the start coordinator)
    // ---------------------------------------------------------------

    pub(crate) fn begin_start(
        &self,
        id: &EmulatorId,
        caller_deadline: Option<Instant>,
        default_deadline: Option<Duration>,
    ) -> Result<StartPlan, BrokerError> {
        let mut inner = self.inner.lock();
        let rec = inner
            .emulators
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(format!("emulator {id}")))?;

        match rec.state {
            EmulatorState::Online => Err(BrokerError::AlreadyExists(format!(
                "emulator {id} is already online"
            ))),
            EmulatorState::Starting => {
                let readiness = rec.readiness.get_or_insert_with(Readiness::new);
                Ok(StartPlan::Join {
                    waiter: readiness.subscribe(),
                    deadline: rec.start_deadline,
                })
            }
            EmulatorState::Offline => {
                rec.state = EmulatorState::Starting;
                rec.cycle += 1;
                rec.expanded = None;

                let readiness = Readiness::new();
                let waiter = readiness.subscribe();
                rec.readiness = Some(readiness);

                let default = default_deadline.map(|d| Instant::now() + d);
                let deadline = match (caller_deadline, default) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                rec.start_deadline = deadline;

                Ok(StartPlan::Launch {
                    cycle: rec.cycle,
                    command: rec.spec.start_command.clone(),
                    waiter,
                    deadline,
                })
            }
        }
    }

    /// Hand the spawned child and its expansion to the record. `Stale`
    /// means the start cycle ended meanwhile; the caller keeps ownership
    /// of the child and the leased ports.
    pub(crate) fn attach_child(
        &self,
        id: &EmulatorId,
        cycle: u64,
        child: Arc<dyn ChildProcess>,
        expanded: ExpandedCommand,
    ) -> Attach {
        let mut inner = self.inner.lock();
        let Some(rec) = inner.emulators.get_mut(id) else {
            return Attach::Stale;
        };
        // A fast child may have reported online before the spawn call
        // returned; the attach is still current as long as the cycle
        // matches and the record has not gone back offline.
        if rec.cycle != cycle || rec.state == EmulatorState::Offline {
            return Attach::Stale;
        }
        rec.leased_ports = expanded.ports.values().copied().collect();
        rec.expanded = Some(expanded);
        rec.child = Some(child);
        Attach::Attached
    }

    /// Conclude a start that failed before the child was running.
    pub(crate) fn fail_start(&self, id: &EmulatorId, cycle: u64, error: BrokerError) {
        let mut inner = self.inner.lock();
        {
            let Some(rec) = inner.emulators.get_mut(id) else {
                return;
            };
            if rec.cycle != cycle || rec.state != EmulatorState::Starting {
                return;
            }
            if let Some(readiness) = &rec.readiness {
                readiness.fire(StartOutcome::Failed(error));
            }
        }
        Self::offline_locked(&mut inner, &self.picker, id);
    }

    /// The emulator reported itself ready.
    pub fn report_online(
        &self,
        id: &EmulatorId,
        resolved_host: &str,
        extra_patterns: Vec<String>,
    ) -> Result<(), BrokerError> {
        let compiled = compile_patterns(&extra_patterns)?;

        let mut inner = self.inner.lock();
        let rule_id = {
            let rec = inner
                .emulators
                .get_mut(id)
                .ok_or_else(|| BrokerError::NotFound(format!("emulator {id}")))?;
            if rec.state != EmulatorState::Starting {
                return Err(BrokerError::FailedPrecondition(format!(
                    "emulator {id} is {}, not starting",
                    rec.state
                )));
            }
            let fired = rec
                .readiness
                .as_ref()
                .is_some_and(|r| r.fire(StartOutcome::Online));
            if !fired {
                // The deadline (or a stop) won the race.
                return Err(BrokerError::FailedPrecondition(format!(
                    "emulator {id} start already concluded"
                )));
            }
            rec.state = EmulatorState::Online;
            rec.start_deadline = None;
            rec.rule_id().clone()
        };

        if let Some(entry) = inner.rules.get_mut(&rule_id) {
            entry.rule.resolved_host = resolved_host.to_string();
            for (pattern, regex) in extra_patterns.into_iter().zip(compiled) {
                if entry.rule.target_patterns.insert(pattern) {
                    entry.compiled.push(regex);
                }
            }
        }
        info!(emulator = %id, resolved_host, "emulator online");
        Ok(())
    }

    /// Child-exit observation, guarded by the start-cycle generation.
    pub(crate) fn on_child_exit(&self, id: &EmulatorId, cycle: u64, code: Option<i32>) {
        let mut inner = self.inner.lock();
        {
            let Some(rec) = inner.emulators.get_mut(id) else {
                return;
            };
            if rec.cycle != cycle || rec.state == EmulatorState::Offline {
                return;
            }
            if rec.state == EmulatorState::Starting {
                let detail = match code {
                    Some(code) => format!("emulator {id} exited with status {code} before reporting online"),
                    None => format!("emulator {id} exited before reporting online"),
                };
                warn!(emulator = %id, ?code, "child exited while starting");
                if let Some(readiness) = &rec.readiness {
                    readiness.fire(StartOutcome::Failed(BrokerError::Aborted(detail)));
                }
            } else {
                info!(emulator = %id, ?code, "child exited");
            }
        }
        Self::offline_locked(&mut inner, &self.picker, id);
    }

    /// The deadline elapsed while starting. Returns the child to
    /// interrupt (outside the lock) when this caller won the race.
    pub(crate) fn deadline_expired(&self, id: &EmulatorId) -> Option<Arc<dyn ChildProcess>> {
        let mut inner = self.inner.lock();
        let child = {
            let rec = inner.emulators.get_mut(id)?;
            if rec.state != EmulatorState::Starting {
                return None;
            }
            let fired = rec.readiness.as_ref().is_some_and(|r| {
                r.fire(StartOutcome::Failed(BrokerError::DeadlineExceeded(format!(
                    "emulator {id} did not report online before its deadline"
                ))))
            });
            if !fired {
                return None;
            }
            rec.child.take()
        };
        Self::offline_locked(&mut inner, &self.picker, id);
        child
    }

    /// Begin a stop: transition to OFFLINE and return the child (if
    /// any) for the caller to terminate outside the lock.
    pub(crate) fn begin_stop(
        &self,
        id: &EmulatorId,
    ) -> Result<Option<Arc<dyn ChildProcess>>, BrokerError> {
        let mut inner = self.inner.lock();
        let child = {
            let rec = inner
                .emulators
                .get_mut(id)
                .ok_or_else(|| BrokerError::NotFound(format!("emulator {id}")))?;
            match rec.state {
                EmulatorState::Offline => return Ok(None),
                EmulatorState::Starting => {
                    if let Some(readiness) = &rec.readiness {
                        readiness.fire(StartOutcome::Failed(BrokerError::Aborted(format!(
                            "emulator {id} was stopped"
                        ))));
                    }
                }
                EmulatorState::Online => {}
            }
            // Invalidate the exit watcher for the outgoing child.
            rec.cycle += 1;
            rec.child.take()
        };
        Self::offline_locked(&mut inner, &self.picker, id);
        info!(emulator = %id, "emulator stopped");
        Ok(child)
    }

    /// Revert a record to OFFLINE: drop the child handle and readiness,
    /// release leased ports, clear the rule's resolved host.
    fn offline_locked(inner: &mut Inner, picker: &PortPicker, id: &EmulatorId) {
        let rule_id = {
            let Some(rec) = inner.emulators.get_mut(id) else {
                return;
            };
            rec.state = EmulatorState::Offline;
            rec.child = None;
            rec.readiness = None;
            rec.start_deadline = None;
            for port in rec.leased_ports.drain(..) {
                picker.release(port);
            }
            rec.rule_id().clone()
        };
        if let Some(entry) = inner.rules.get_mut(&rule_id) {
            entry.rule.resolved_host.clear();
        }
    }

    // ---------------------------------------------------------------
    // Resolver support
    // ---------------------------------------------------------------

    /// Match a target against every rule. Iteration is sorted by rule id
    /// so ties break deterministically; collisions are logged.
    pub(crate) fn match_target(&self, target: &str) -> Option<MatchedRule> {
        let inner = self.inner.lock();
        let mut matching: Vec<&RuleId> = inner
            .rules
            .iter()
            .filter(|(_, entry)| entry.compiled.iter().any(|re| re.is_match(target)))
            .map(|(id, _)| id)
            .collect();
        matching.sort();
        if matching.len() > 1 {
            warn!(resolve_target = target, rules = ?matching, "target matches multiple resolve rules");
        }

        let rule_id = (*matching.first()?).clone();
        let entry = inner.rules.get(&rule_id)?;
        let owner = entry.owner.as_ref().and_then(|emulator_id| {
            inner.emulators.get(emulator_id).map(|rec| OwnerSnapshot {
                emulator_id: emulator_id.clone(),
                state: rec.state,
                start_on_demand: rec.spec.start_on_demand,
                waiter: match rec.state {
                    EmulatorState::Starting => rec.readiness.as_ref().map(|r| r.subscribe()),
                    _ => None,
                },
            })
        });
        Some(MatchedRule { rule_id, owner })
    }

    /// Current resolved host and secure flag for a rule.
    pub(crate) fn rule_host(&self, rule_id: &RuleId) -> Option<(String, bool)> {
        self.inner.lock().rules.get(rule_id).map(|entry| {
            (
                entry.rule.resolved_host.clone(),
                entry.rule.requires_secure_connection,
            )
        })
    }

    /// First target pattern of an emulator's rule (proxied connections
    /// resolve this to find their destination).
    pub(crate) fn first_target_pattern(&self, id: &EmulatorId) -> Option<String> {
        let inner = self.inner.lock();
        let rec = inner.emulators.get(id)?;
        let entry = inner.rules.get(rec.rule_id())?;
        entry.rule.target_patterns.iter().next().cloned()
    }

    // ---------------------------------------------------------------
    // Proxy slots
    // ---------------------------------------------------------------

    /// Reserve the proxy slot for an emulator while its listener binds.
    pub(crate) fn reserve_proxy(&self, id: &EmulatorId) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if !inner.emulators.contains_key(id) {
            return Err(BrokerError::FailedPrecondition(format!(
                "no emulator {id} to proxy"
            )));
        }
        if inner.proxies.contains_key(id) {
            return Err(BrokerError::AlreadyExists(format!(
                "proxy for emulator {id}"
            )));
        }
        inner.proxies.insert(id.clone(), ProxySlot::Reserved);
        Ok(())
    }

    pub(crate) fn cancel_proxy_reservation(&self, id: &EmulatorId) {
        let mut inner = self.inner.lock();
        if matches!(inner.proxies.get(id), Some(ProxySlot::Reserved)) {
            inner.proxies.remove(id);
        }
    }

    pub(crate) fn commit_proxy(&self, id: &EmulatorId, entry: ProxyEntry) {
        self.inner
            .lock()
            .proxies
            .insert(id.clone(), ProxySlot::Active(entry));
    }

    pub(crate) fn proxy_port(&self, id: &EmulatorId) -> Option<u16> {
        match self.inner.lock().proxies.get(id) {
            Some(ProxySlot::Active(entry)) => Some(entry.port),
            _ => None,
        }
    }

    pub(crate) fn proxy_ports(&self) -> Vec<(EmulatorId, u16)> {
        let inner = self.inner.lock();
        let mut ports: Vec<(EmulatorId, u16)> = inner
            .proxies
            .iter()
            .filter_map(|(id, slot)| match slot {
                ProxySlot::Active(entry) => Some((id.clone(), entry.port)),
                ProxySlot::Reserved => None,
            })
            .collect();
        ports.sort_by(|a, b| a.0.cmp(&b.0));
        ports
    }

    /// Drain every active proxy for shutdown.
    pub(crate) fn take_proxies(&self) -> Vec<(EmulatorId, ProxyEntry)> {
        let mut inner = self.inner.lock();
        let ids: Vec<EmulatorId> = inner.proxies.keys().cloned().collect();
        let mut taken = Vec::new();
        for id in ids {
            if let Some(ProxySlot::Active(entry)) = inner.proxies.remove(&id) {
                taken.push((id, entry));
            }
        }
        taken
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
