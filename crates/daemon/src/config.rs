// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker configuration.
//!
//! Loaded from a TOML file at startup and applied by replaying the
//! pre-declared rules and emulators against the empty registry. A
//! replay failure is a startup failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use broker_core::{BrokerError, EmulatorSpec, ResolveRule};
use broker_engine::Registry;

/// Default bound on emulator starts (one minute).
pub const DEFAULT_START_DEADLINE_MS: u64 = 60_000;

/// Broker configuration file contents.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address for the RPC endpoint; port 0 picks a free port.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// `[begin, end)` port ranges the picker leases from. Empty defers
    /// to OS ephemeral assignment.
    #[serde(default)]
    pub port_ranges: Vec<[u16; 2]>,

    /// Bound on emulator starts, in milliseconds. 0 disables the
    /// default deadline entirely.
    #[serde(default = "default_start_deadline_ms")]
    pub default_emulator_start_deadline_ms: u64,

    /// Emulators registered at startup.
    #[serde(default)]
    pub emulators: Vec<EmulatorSpec>,

    /// Standalone rules registered at startup.
    #[serde(default)]
    pub rules: Vec<ResolveRule>,
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_start_deadline_ms() -> u64 {
    DEFAULT_START_DEADLINE_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port_ranges: Vec::new(),
            default_emulator_start_deadline_ms: default_start_deadline_ms(),
            emulators: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
}

impl Config {
    /// Load and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// The configured default start deadline, if any.
    pub fn default_start_deadline(&self) -> Option<Duration> {
        match self.default_emulator_start_deadline_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Port ranges as `(begin, end)` pairs.
    pub fn port_ranges(&self) -> Vec<(u16, u16)> {
        self.port_ranges.iter().map(|r| (r[0], r[1])).collect()
    }

    /// Replay the pre-declared rules and emulators into `registry`.
    pub fn apply(&self, registry: &Registry) -> Result<(), BrokerError> {
        for rule in &self.rules {
            registry.create_resolve_rule(rule.clone())?;
        }
        for emulator in &self.emulators {
            registry.create_emulator(emulator.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
