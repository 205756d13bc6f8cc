// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-emulator runtime record.
//!
//! Invariants, all maintained under the registry mutex:
//! - a child handle exists iff the state is not offline;
//! - `readiness` is armed (Some) exactly while starting and fires at
//!   most once per start cycle;
//! - `cycle` increments on every OFFLINE → STARTING transition and on
//!   stop, so callbacks from a previous cycle are no-ops.

use std::sync::Arc;
use std::time::Instant;

use broker_core::{EmulatorSpec, EmulatorState, RuleId};

use crate::command::ExpandedCommand;
use crate::launcher::ChildProcess;
use crate::readiness::Readiness;

pub(crate) struct EmulatorRecord {
    /// The registration payload as submitted (rule state lives in the
    /// registry's rule table, keyed by `spec.rule.rule_id`).
    pub spec: EmulatorSpec,
    pub state: EmulatorState,
    /// Start-cycle generation guard.
    pub cycle: u64,
    pub child: Option<Arc<dyn ChildProcess>>,
    pub start_deadline: Option<Instant>,
    pub readiness: Option<Readiness>,
    /// Result of the most recent command expansion, kept for
    /// `GetEmulator` after a start.
    pub expanded: Option<ExpandedCommand>,
    /// Ports leased for the current child; released on stop.
    pub leased_ports: Vec<u16>,
}

impl EmulatorRecord {
    pub fn new(spec: EmulatorSpec) -> Self {
        Self {
            spec,
            state: EmulatorState::Offline,
            cycle: 0,
            child: None,
            start_deadline: None,
            readiness: None,
            expanded: None,
            leased_ports: Vec::new(),
        }
    }

    pub fn rule_id(&self) -> &RuleId {
        &self.spec.rule.rule_id
    }
}
