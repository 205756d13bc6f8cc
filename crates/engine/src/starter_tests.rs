// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::launcher::FakeLauncher;
use crate::ports::PortPicker;
use broker_core::{EmulatorSpec, EmulatorState, ResolveRule, RuleId, StartCommand};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    registry: Arc<Registry>,
    picker: Arc<PortPicker>,
    launcher: FakeLauncher,
    starter: Arc<Starter>,
}

fn harness(ranges: Vec<(u16, u16)>, default_deadline: Option<Duration>) -> Harness {
    let picker = Arc::new(PortPicker::new(ranges).unwrap());
    let registry = Arc::new(Registry::new(Arc::clone(&picker)));
    let launcher = FakeLauncher::new();
    let starter = Arc::new(Starter::new(
        Arc::clone(&registry),
        Arc::clone(&picker),
        Arc::new(launcher.clone()),
        "127.0.0.1:9999".to_string(),
        PathBuf::from("/opt/broker"),
        default_deadline,
    ));
    Harness {
        registry,
        picker,
        launcher,
        starter,
    }
}

fn spec(id: &str, pattern: &str) -> EmulatorSpec {
    EmulatorSpec {
        emulator_id: EmulatorId::new(id),
        rule: ResolveRule {
            rule_id: RuleId::new(format!("{id}-rule")),
            target_patterns: [pattern.to_string()].into(),
            ..Default::default()
        },
        start_command: StartCommand {
            path: "/bin/emulator".to_string(),
            args: vec!["--port={port:main}".to_string()],
        },
        start_on_demand: true,
    }
}

fn start_task(
    h: &Harness,
    id: &str,
) -> tokio::task::JoinHandle<Result<(), BrokerError>> {
    let starter = Arc::clone(&h.starter);
    let id = EmulatorId::new(id);
    tokio::spawn(async move { starter.start(&id, None).await })
}

#[tokio::test]
async fn basic_lifecycle_reaches_online() {
    let h = harness(vec![(46300, 46301)], None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let task = start_task(&h, "real");
    let children = h.launcher.wait_for_launches(1).await;

    // The child was launched with the expanded command and the broker
    // address in its environment.
    let launched = &children[0].spec;
    assert_eq!(launched.args, vec!["--port=46300".to_string()]);
    assert!(launched
        .env
        .contains(&(BROKER_ADDRESS_ENV.to_string(), "127.0.0.1:9999".to_string())));

    h.registry
        .report_online(&EmulatorId::new("real"), "localhost:46300", Vec::new())
        .unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    let view = h.registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert_eq!(view.state, EmulatorState::Online);
    assert_eq!(view.rule.resolved_host, "localhost:46300");
    let expanded = view.expanded_command.unwrap();
    assert_eq!(expanded.ports["main"], 46300);
}

#[tokio::test]
async fn concurrent_starts_share_one_child() {
    let h = harness(vec![(46302, 46303)], None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let first = start_task(&h, "real");
    let second = start_task(&h, "real");

    h.launcher.wait_for_launches(1).await;
    // Give the second caller time to join before the report.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.launcher.launch_count(), 1);

    h.registry
        .report_online(&EmulatorId::new("real"), "localhost:46302", Vec::new())
        .unwrap();

    tokio::time::timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(WAIT, second).await.unwrap().unwrap().unwrap();
    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test]
async fn deadline_reverts_to_offline_and_releases_ports() {
    let h = harness(vec![(46304, 46305)], Some(Duration::from_millis(50)));
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let err = h
        .starter
        .start(&EmulatorId::new("real"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DeadlineExceeded(_)));

    let view = h.registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert_eq!(view.state, EmulatorState::Offline);
    assert_eq!(view.rule.resolved_host, "");

    // The leased port went back to the pool.
    assert_eq!(h.picker.next().unwrap(), 46304);

    // The child got the interrupt from the detached terminate task.
    let children = h.launcher.children();
    for _ in 0..100 {
        if children[0].interrupt_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(children[0].interrupt_count(), 1);
}

#[tokio::test]
async fn late_report_after_deadline_is_failed_precondition() {
    let h = harness(Vec::new(), Some(Duration::from_millis(30)));
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let _ = h.starter.start(&EmulatorId::new("real"), None).await;
    let err = h
        .registry
        .report_online(&EmulatorId::new("real"), "localhost:1", Vec::new())
        .unwrap_err();
    assert!(matches!(err, BrokerError::FailedPrecondition(_)));
}

#[tokio::test]
async fn child_exit_while_starting_aborts() {
    let h = harness(Vec::new(), None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let task = start_task(&h, "real");
    let children = h.launcher.wait_for_launches(1).await;
    children[0].exit(3);

    let err = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Aborted(_)));
    assert!(err.to_string().contains("status 3"), "got: {err}");

    let view = h.registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert_eq!(view.state, EmulatorState::Offline);
}

#[tokio::test]
async fn spawn_failure_aborts_and_reverts() {
    let h = harness(vec![(46306, 46307)], None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();
    h.launcher.fail_next();

    let err = h
        .starter
        .start(&EmulatorId::new("real"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Aborted(_)));

    let view = h.registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert_eq!(view.state, EmulatorState::Offline);
    assert_eq!(h.picker.next().unwrap(), 46306);
}

#[tokio::test]
async fn start_errors_on_unknown_and_online() {
    let h = harness(Vec::new(), None);
    assert!(matches!(
        h.starter.start(&EmulatorId::new("ghost"), None).await,
        Err(BrokerError::NotFound(_))
    ));

    h.registry.create_emulator(spec("real", "real_service")).unwrap();
    let task = start_task(&h, "real");
    h.launcher.wait_for_launches(1).await;
    h.registry
        .report_online(&EmulatorId::new("real"), "localhost:1", Vec::new())
        .unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    assert!(matches!(
        h.starter.start(&EmulatorId::new("real"), None).await,
        Err(BrokerError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn report_online_merges_extra_patterns() {
    let h = harness(Vec::new(), None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let task = start_task(&h, "real");
    h.launcher.wait_for_launches(1).await;
    h.registry
        .report_online(
            &EmulatorId::new("real"),
            "localhost:1",
            vec!["extra_service".to_string()],
        )
        .unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    let view = h.registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert!(view.rule.target_patterns.contains("real_service"));
    assert!(view.rule.target_patterns.contains("extra_service"));
}

#[tokio::test]
async fn stop_on_offline_is_a_noop() {
    let h = harness(Vec::new(), None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();
    h.starter.stop(&EmulatorId::new("real")).await.unwrap();

    assert!(matches!(
        h.starter.stop(&EmulatorId::new("ghost")).await,
        Err(BrokerError::NotFound(_))
    ));
}

#[tokio::test]
async fn stop_online_clears_host_and_releases_ports() {
    let h = harness(vec![(46308, 46309)], None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let task = start_task(&h, "real");
    h.launcher.wait_for_launches(1).await;
    h.registry
        .report_online(&EmulatorId::new("real"), "localhost:46308", Vec::new())
        .unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    h.starter.stop(&EmulatorId::new("real")).await.unwrap();

    let view = h.registry.get_emulator(&EmulatorId::new("real")).unwrap();
    assert_eq!(view.state, EmulatorState::Offline);
    assert_eq!(view.rule.resolved_host, "");
    assert_eq!(h.picker.next().unwrap(), 46308);
    assert_eq!(h.launcher.children()[0].interrupt_count(), 1);
}

#[tokio::test]
async fn stop_escalates_to_kill_when_interrupt_is_ignored() {
    let h = harness(Vec::new(), None);
    h.launcher.ignore_signals();
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let task = start_task(&h, "real");
    let children = h.launcher.wait_for_launches(1).await;
    h.registry
        .report_online(&EmulatorId::new("real"), "localhost:1", Vec::new())
        .unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    // The interrupt is ignored; stop() force-kills after the grace
    // period and returns.
    tokio::time::timeout(Duration::from_secs(10), h.starter.stop(&EmulatorId::new("real")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(children[0].interrupt_count(), 1);
    assert_eq!(children[0].kill_count(), 1);
}

#[tokio::test]
async fn stop_while_starting_aborts_the_start() {
    let h = harness(Vec::new(), None);
    h.registry.create_emulator(spec("real", "real_service")).unwrap();

    let task = start_task(&h, "real");
    h.launcher.wait_for_launches(1).await;
    h.starter.stop(&EmulatorId::new("real")).await.unwrap();

    let err = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Aborted(_)));
}
