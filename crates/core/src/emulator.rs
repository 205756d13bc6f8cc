// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Emulator registration payload and lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::id::EmulatorId;
use crate::rule::ResolveRule;

/// How to launch an emulator child process. `path` and `args` may carry
/// substitution tokens (`{port:NAME}`, `{env:NAME}`, `{dir:broker}`)
/// expanded at start time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Registration payload for an emulator. Every emulator owns exactly one
/// resolve rule; the rule is stored independently in the registry and
/// referenced by its id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorSpec {
    pub emulator_id: EmulatorId,

    /// The emulator's resolve rule.
    #[serde(default)]
    pub rule: ResolveRule,

    /// Command executed on start.
    #[serde(default)]
    pub start_command: StartCommand,

    /// Whether a resolve (or proxied connection) may start this emulator.
    #[serde(default)]
    pub start_on_demand: bool,
}

impl EmulatorSpec {
    /// Validate ids, the presence of a rule and a command, and the rule's
    /// patterns.
    pub fn validate(&self) -> Result<(), BrokerError> {
        self.emulator_id.check()?;
        if self.rule.rule_id.as_str().is_empty() {
            return Err(BrokerError::InvalidArgument(format!(
                "emulator {:?} has no rule",
                self.emulator_id
            )));
        }
        if self.start_command.path.is_empty() {
            return Err(BrokerError::InvalidArgument(format!(
                "emulator {:?} has no start command",
                self.emulator_id
            )));
        }
        self.rule.validate()
    }
}

/// Lifecycle state of a registered emulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulatorState {
    /// No child process; the initial state.
    #[default]
    Offline,
    /// Child spawned, not yet reported online.
    Starting,
    /// Child reported online and serves its resolved host.
    Online,
}

impl fmt::Display for EmulatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorState::Offline => write!(f, "offline"),
            EmulatorState::Starting => write!(f, "starting"),
            EmulatorState::Online => write!(f, "online"),
        }
    }
}

#[cfg(test)]
#[path = "emulator_tests.rs"]
mod tests;
