// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::ports::PortPicker;
use broker_core::{EmulatorSpec, ResolveRule, StartCommand};

fn registry() -> Registry {
    Registry::new(Arc::new(PortPicker::new(Vec::new()).unwrap()))
}

fn rule(id: &str, patterns: &[&str]) -> ResolveRule {
    ResolveRule {
        rule_id: RuleId::new(id),
        target_patterns: patterns.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

fn spec(id: &str, patterns: &[&str]) -> EmulatorSpec {
    EmulatorSpec {
        emulator_id: EmulatorId::new(id),
        rule: rule(&format!("{id}-rule"), patterns),
        start_command: StartCommand {
            path: "/bin/emulator".to_string(),
            args: vec!["--port={port:main}".to_string()],
        },
        start_on_demand: false,
    }
}

#[test]
fn create_get_round_trip() {
    let registry = registry();
    let submitted = spec("real", &["real_service"]);
    registry.create_emulator(submitted.clone()).unwrap();

    let view = registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert_eq!(view.emulator_id, submitted.emulator_id);
    assert_eq!(view.rule, submitted.rule);
    assert_eq!(view.start_command, submitted.start_command);
    assert_eq!(view.state, EmulatorState::Offline);
    assert!(view.expanded_command.is_none());
}

#[test]
fn duplicate_emulator_is_already_exists() {
    let registry = registry();
    registry.create_emulator(spec("real", &["a"])).unwrap();
    assert!(matches!(
        registry.create_emulator(spec("real", &["a"])),
        Err(BrokerError::AlreadyExists(_))
    ));
}

#[test]
fn invalid_emulator_is_rejected() {
    let registry = registry();
    let mut bad = spec("real", &["a"]);
    bad.start_command.path.clear();
    assert!(matches!(
        registry.create_emulator(bad),
        Err(BrokerError::InvalidArgument(_))
    ));

    assert!(matches!(
        registry.create_emulator(spec("real", &["(["])),
        Err(BrokerError::InvalidArgument(_))
    ));
}

#[test]
fn get_unknown_emulator_is_not_found() {
    assert!(matches!(
        registry().get_emulator(&EmulatorId::new("nope")),
        Err(BrokerError::NotFound(_))
    ));
}

#[test]
fn list_emulators_is_sorted() {
    let registry = registry();
    registry.create_emulator(spec("zeta", &["z"])).unwrap();
    registry.create_emulator(spec("alpha", &["a"])).unwrap();
    let ids: Vec<String> = registry
        .list_emulators()
        .into_iter()
        .map(|v| v.emulator_id.to_string())
        .collect();
    assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
}

#[test]
fn identical_rule_create_is_idempotent() {
    let registry = registry();
    let r = rule("r1", &["x", "y"]);
    registry.create_resolve_rule(r.clone()).unwrap();

    // Same rule, different pattern order: success no-op.
    let reordered = rule("r1", &["y", "x"]);
    registry.create_resolve_rule(reordered).unwrap();
    assert_eq!(registry.get_resolve_rule(&RuleId::new("r1")).unwrap(), r);
}

#[test]
fn differing_rule_create_is_already_exists() {
    let registry = registry();
    registry.create_resolve_rule(rule("r1", &["x"])).unwrap();
    assert!(matches!(
        registry.create_resolve_rule(rule("r1", &["x", "z"])),
        Err(BrokerError::AlreadyExists(_))
    ));
}

#[test]
fn update_merges_patterns_and_overwrites_scalars() {
    let registry = registry();
    registry.create_resolve_rule(rule("r1", &["a", "b"])).unwrap();

    let mut update = rule("r1", &["b", "c"]);
    update.resolved_host = "localhost:9000".to_string();
    update.requires_secure_connection = true;
    registry.update_resolve_rule(update).unwrap();

    let stored = registry.get_resolve_rule(&RuleId::new("r1")).unwrap();
    let patterns: Vec<&str> = stored.target_patterns.iter().map(|s| s.as_str()).collect();
    assert_eq!(patterns, vec!["a", "b", "c"]);
    assert_eq!(stored.resolved_host, "localhost:9000");
    assert!(stored.requires_secure_connection);
}

#[test]
fn update_unknown_rule_is_not_found() {
    assert!(matches!(
        registry().update_resolve_rule(rule("ghost", &["a"])),
        Err(BrokerError::NotFound(_))
    ));
}

#[test]
fn update_with_bad_pattern_is_rejected() {
    let registry = registry();
    registry.create_resolve_rule(rule("r1", &["a"])).unwrap();
    assert!(matches!(
        registry.update_resolve_rule(rule("r1", &["(["])),
        Err(BrokerError::InvalidArgument(_))
    ));
    // Unchanged after the failed update.
    assert_eq!(
        registry.get_resolve_rule(&RuleId::new("r1")).unwrap(),
        rule("r1", &["a"])
    );
}

#[test]
fn emulator_adopts_an_identical_standalone_rule() {
    let registry = registry();
    registry
        .create_resolve_rule(rule("real-rule", &["real_service"]))
        .unwrap();
    registry
        .create_emulator(spec("real", &["real_service"]))
        .unwrap();

    // The rule is now owned; a second emulator may not claim it.
    let mut other = spec("other", &["real_service"]);
    other.rule.rule_id = RuleId::new("real-rule");
    assert!(matches!(
        registry.create_emulator(other),
        Err(BrokerError::AlreadyExists(_))
    ));
}

#[test]
fn emulator_with_differing_rule_definition_is_rejected() {
    let registry = registry();
    registry
        .create_resolve_rule(rule("real-rule", &["something_else"]))
        .unwrap();
    let mut e = spec("real", &["real_service"]);
    e.rule.rule_id = RuleId::new("real-rule");
    assert!(matches!(
        registry.create_emulator(e),
        Err(BrokerError::AlreadyExists(_))
    ));
}

#[test]
fn report_online_requires_starting() {
    let registry = registry();
    registry.create_emulator(spec("real", &["a"])).unwrap();

    let err = registry
        .report_online(&EmulatorId::new("real"), "localhost:1", Vec::new())
        .unwrap_err();
    assert!(matches!(err, BrokerError::FailedPrecondition(_)));

    assert!(matches!(
        registry.report_online(&EmulatorId::new("ghost"), "h", Vec::new()),
        Err(BrokerError::NotFound(_))
    ));
}

#[test]
fn match_target_prefers_lowest_rule_id() {
    let registry = registry();
    let mut r2 = rule("b-rule", &["svc"]);
    r2.resolved_host = "b-host".to_string();
    let mut r1 = rule("a-rule", &["svc"]);
    r1.resolved_host = "a-host".to_string();
    registry.create_resolve_rule(r2).unwrap();
    registry.create_resolve_rule(r1).unwrap();

    let matched = registry.match_target("svc").unwrap();
    assert_eq!(matched.rule_id, RuleId::new("a-rule"));
}

#[test]
fn match_target_misses_cleanly() {
    let registry = registry();
    registry.create_resolve_rule(rule("r1", &["^svc$"])).unwrap();
    assert!(registry.match_target("other").is_none());
}

#[test]
fn first_target_pattern_is_deterministic() {
    let registry = registry();
    registry
        .create_emulator(spec("real", &["zz", "aa"]))
        .unwrap();
    assert_eq!(
        registry.first_target_pattern(&EmulatorId::new("real")),
        Some("aa".to_string())
    );
}

#[test]
fn proxy_reservation_lifecycle() {
    let registry = registry();
    let id = EmulatorId::new("real");
    registry.create_emulator(spec("real", &["a"])).unwrap();

    registry.reserve_proxy(&id).unwrap();
    assert!(matches!(
        registry.reserve_proxy(&id),
        Err(BrokerError::AlreadyExists(_))
    ));

    registry.cancel_proxy_reservation(&id);
    registry.reserve_proxy(&id).unwrap();
}

#[test]
fn proxy_requires_an_emulator() {
    let registry = registry();
    assert!(matches!(
        registry.reserve_proxy(&EmulatorId::new("ghost")),
        Err(BrokerError::FailedPrecondition(_))
    ));
}
