// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Start-command token expansion.
//!
//! Rewrites an emulator's path and argv before launch:
//!
//! | Token         | Replacement                                        |
//! |---------------|----------------------------------------------------|
//! | `{port:NAME}` | a leased port; identical NAMEs share one port      |
//! | `{env:NAME}`  | the environment variable's value, or empty         |
//! | `{dir:broker}`| absolute directory of the broker binary            |
//!
//! NAMEs are scoped to a single start. An empty NAME (or any other
//! malformed token) is left literal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use broker_core::{BrokerError, StartCommand};

use crate::ports::PortPicker;

/// Token pattern: `{port:NAME}`, `{env:NAME}`, `{dir:NAME}` with a
/// non-empty NAME of letters, digits, dots, and dashes.
// Allow expect here as the regex is compile-time verified to be valid
#[allow(clippy::expect_used)]
static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(port|env|dir):([A-Za-z0-9.\-]+)\}").expect("constant regex pattern is valid")
});

/// An expanded command line plus the ports leased for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedCommand {
    pub path: String,
    pub args: Vec<String>,
    /// `NAME → port` for every `{port:NAME}` token in this start.
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

/// Expand every token in `command`, leasing ports from `picker`.
///
/// On failure all ports leased by this expansion are released before
/// the error is returned.
pub fn expand(
    command: &StartCommand,
    picker: &PortPicker,
    broker_dir: &Path,
) -> Result<ExpandedCommand, BrokerError> {
    let ports = lease_ports(command, picker)?;
    let broker_dir = broker_dir.display().to_string();

    let path = expand_str(&command.path, &ports, &broker_dir);
    let args = command
        .args
        .iter()
        .map(|arg| expand_str(arg, &ports, &broker_dir))
        .collect();

    Ok(ExpandedCommand { path, args, ports })
}

fn expand_str(text: &str, ports: &HashMap<String, u16>, broker_dir: &str) -> String {
    TOKEN_PATTERN
        .replace_all(text, |caps: &Captures| {
            let name = &caps[2];
            match &caps[1] {
                "port" => match ports.get(name) {
                    Some(port) => port.to_string(),
                    None => caps[0].to_string(),
                },
                "env" => std::env::var(name).unwrap_or_default(),
                "dir" if name == "broker" => broker_dir.to_string(),
                _ => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Lease one port per distinct `{port:NAME}` token. On a lease failure
/// the ports already taken are handed back.
fn lease_ports(
    command: &StartCommand,
    picker: &PortPicker,
) -> Result<HashMap<String, u16>, BrokerError> {
    let mut ports: HashMap<String, u16> = HashMap::new();
    for text in std::iter::once(&command.path).chain(command.args.iter()) {
        for caps in TOKEN_PATTERN.captures_iter(text) {
            if &caps[1] != "port" {
                continue;
            }
            let name = caps[2].to_string();
            if ports.contains_key(&name) {
                continue;
            }
            match picker.next() {
                Ok(port) => {
                    ports.insert(name, port);
                }
                Err(e) => {
                    for port in ports.values() {
                        picker.release(*port);
                    }
                    return Err(BrokerError::Internal(format!(
                        "port lease for {{port:{name}}} failed: {e}"
                    )));
                }
            }
        }
    }
    Ok(ports)
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
