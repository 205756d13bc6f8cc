// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use super::*;
use broker_core::{EmulatorId, RuleId};
use broker_engine::{PortPicker, Registry};

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broker.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn defaults_apply_when_fields_are_absent() {
    let (_dir, path) = write_config("");
    let config = Config::load(&path).unwrap();
    assert_eq!(config.listen, "127.0.0.1:0");
    assert!(config.port_ranges().is_empty());
    assert_eq!(
        config.default_start_deadline(),
        Some(Duration::from_millis(DEFAULT_START_DEADLINE_MS))
    );
    assert!(config.emulators.is_empty());
    assert!(config.rules.is_empty());
}

#[test]
fn full_config_parses() {
    let (_dir, path) = write_config(
        r#"
listen = "127.0.0.1:10000"
port_ranges = [[20000, 20010]]
default_emulator_start_deadline_ms = 1000

[[rules]]
rule_id = "standalone"
target_patterns = ["static_service"]
resolved_host = "localhost:9090"
requires_secure_connection = true

[[emulators]]
emulator_id = "real"
start_on_demand = true

[emulators.rule]
rule_id = "real-rule"
target_patterns = ["real_service"]

[emulators.start_command]
path = "/usr/bin/real-emulator"
args = ["--port={port:real}"]
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.listen, "127.0.0.1:10000");
    assert_eq!(config.port_ranges(), vec![(20000, 20010)]);
    assert_eq!(
        config.default_start_deadline(),
        Some(Duration::from_millis(1000))
    );
    assert_eq!(config.emulators.len(), 1);
    assert_eq!(config.rules.len(), 1);
    assert!(config.emulators[0].start_on_demand);
}

#[test]
fn zero_deadline_disables_the_default() {
    let (_dir, path) = write_config("default_emulator_start_deadline_ms = 0\n");
    let config = Config::load(&path).unwrap();
    assert_eq!(config.default_start_deadline(), None);
}

#[test]
fn unknown_fields_are_rejected() {
    let (_dir, path) = write_config("unknown_knob = true\n");
    assert!(matches!(
        Config::load(&path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn missing_file_is_a_read_error() {
    assert!(matches!(
        Config::load(std::path::Path::new("/nonexistent/broker.toml")),
        Err(ConfigError::Read { .. })
    ));
}

#[test]
fn apply_replays_rules_and_emulators() {
    let (_dir, path) = write_config(
        r#"
[[rules]]
rule_id = "standalone"
target_patterns = ["static_service"]
resolved_host = "localhost:9090"

[[emulators]]
emulator_id = "real"

[emulators.rule]
rule_id = "real-rule"
target_patterns = ["real_service"]

[emulators.start_command]
path = "/usr/bin/real-emulator"
"#,
    );
    let config = Config::load(&path).unwrap();

    let registry = Registry::new(Arc::new(PortPicker::new(Vec::new()).unwrap()));
    config.apply(&registry).unwrap();

    assert!(registry.get_emulator(&EmulatorId::new("real")).is_ok());
    assert!(registry.get_resolve_rule(&RuleId::new("standalone")).is_ok());
    assert!(registry.get_resolve_rule(&RuleId::new("real-rule")).is_ok());
}

#[test]
fn apply_fails_on_invalid_predeclared_emulator() {
    let (_dir, path) = write_config(
        r#"
[[emulators]]
emulator_id = "real"

[emulators.rule]
rule_id = "real-rule"
"#,
    );
    let config = Config::load(&path).unwrap();
    let registry = Registry::new(Arc::new(PortPicker::new(Vec::new()).unwrap()));
    assert!(matches!(
        config.apply(&registry),
        Err(BrokerError::InvalidArgument(_))
    ));
}
