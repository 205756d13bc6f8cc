// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resolve rules: named sets of target patterns paired with a resolved host.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::id::RuleId;

/// A named mapping from target patterns (regular expressions) to a
/// resolved host.
///
/// A rule may be owned by an emulator or stand alone. `target_patterns`
/// is a deduplicated, order-insensitive set; two rules compare equal
/// regardless of the order patterns were supplied in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRule {
    pub rule_id: RuleId,

    /// Regular expressions matched against unmodified targets.
    #[serde(default)]
    pub target_patterns: BTreeSet<String>,

    /// `host` or `host:port`; empty while the owning emulator is offline.
    #[serde(default)]
    pub resolved_host: String,

    /// Whether clients must use a secure channel to the resolved host.
    #[serde(default)]
    pub requires_secure_connection: bool,
}

impl ResolveRule {
    /// Validate the rule id and compile every pattern.
    pub fn validate(&self) -> Result<(), BrokerError> {
        self.rule_id.check()?;
        compile_patterns(&self.target_patterns)?;
        Ok(())
    }

    /// Union `extra` into the pattern set, requiring each new pattern to
    /// compile. Returns how many patterns were actually added.
    pub fn merge_patterns<I>(&mut self, extra: I) -> Result<usize, BrokerError>
    where
        I: IntoIterator<Item = String>,
    {
        let extra: Vec<String> = extra.into_iter().collect();
        compile_patterns(&extra)?;
        let before = self.target_patterns.len();
        self.target_patterns.extend(extra);
        Ok(self.target_patterns.len() - before)
    }
}

/// Compile a set of patterns, failing with `InvalidArgument` naming the
/// first pattern that does not compile.
pub fn compile_patterns<'a, I>(patterns: I) -> Result<Vec<Regex>, BrokerError>
where
    I: IntoIterator<Item = &'a String>,
{
    patterns
        .into_iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                BrokerError::InvalidArgument(format!("pattern {p:?} does not compile: {e}"))
            })
        })
        .collect()
}

#[cfg(test)]
#[path = "rule_tests.rs"]
mod tests;
