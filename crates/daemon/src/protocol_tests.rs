// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use broker_core::{BrokerError, EmulatorId, EmulatorSpec};
use broker_engine::{EmulatorView, ProxyView};

#[test]
fn request_round_trip() {
    let requests = vec![
        Request::Ping,
        Request::CreateEmulator {
            emulator: EmulatorSpec::default(),
        },
        Request::StartEmulator {
            emulator_id: "real".to_string(),
            timeout_ms: Some(1000),
        },
        Request::ReportEmulatorOnline {
            emulator_id: "real".to_string(),
            resolved_host: "localhost:20000".to_string(),
            target_patterns: vec!["extra".to_string()],
        },
        Request::Resolve {
            target: "http://foo/baz".to_string(),
            timeout_ms: None,
        },
        Request::CreateProxy {
            emulator_id: "real".to_string(),
            port: 0,
        },
        Request::Shutdown,
    ];
    for request in requests {
        let bytes = encode(&request).unwrap();
        let parsed: Request = decode(&bytes).unwrap();
        assert_eq!(parsed, request);
    }
}

#[test]
fn response_round_trip() {
    let responses = vec![
        Response::Ok,
        Response::Pong,
        Response::Resolved {
            target: "https://bar/baz".to_string(),
            requires_secure_connection: true,
        },
        Response::Proxy {
            proxy: ProxyView {
                emulator_id: EmulatorId::new("real"),
                port: 20001,
            },
        },
        Response::Error {
            code: "NOT_FOUND".to_string(),
            message: "not found: emulator real".to_string(),
        },
    ];
    for response in responses {
        let bytes = encode(&response).unwrap();
        let parsed: Response = decode(&bytes).unwrap();
        assert_eq!(parsed, response);
    }
}

#[test]
fn error_response_carries_the_status_code() {
    let err = BrokerError::DeadlineExceeded("emulator real".to_string());
    match Response::error(&err) {
        Response::Error { code, message } => {
            assert_eq!(code, "DEADLINE_EXCEEDED");
            assert!(message.contains("emulator real"));
        }
        other => panic!("expected error response, got {other:?}"),
    }
}

#[test]
fn request_uses_a_type_tag() {
    let json = serde_json::to_value(&Request::ListEmulators).unwrap();
    assert_eq!(json["type"], "ListEmulators");
}

#[test]
fn emulator_view_omits_absent_expansion() {
    let view = EmulatorView {
        emulator_id: EmulatorId::new("real"),
        state: broker_core::EmulatorState::Offline,
        rule: Default::default(),
        start_command: Default::default(),
        start_on_demand: false,
        expanded_command: None,
    };
    let json = serde_json::to_value(&view).unwrap();
    assert!(json.get("expanded_command").is_none());
}

#[tokio::test]
async fn wire_round_trip_over_a_duplex_stream() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let data = encode(&Request::Ping).unwrap();
    write_message(&mut client, &data).await.unwrap();

    let request = read_request(&mut server, DEFAULT_TIMEOUT).await.unwrap();
    assert_eq!(request, Request::Ping);

    write_response(&mut server, &Response::Pong, DEFAULT_TIMEOUT)
        .await
        .unwrap();
    let bytes = read_message(&mut client).await.unwrap();
    let response: Response = decode(&bytes).unwrap();
    assert_eq!(response, Response::Pong);
}

#[tokio::test]
async fn oversized_length_prefix_is_rejected() {
    let (mut client, mut server) = tokio::io::duplex(64);

    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        let _ = client.write_all(&len).await;
    });

    match read_message(&mut server).await {
        Err(ProtocolError::MessageTooLarge { .. }) => {}
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn closed_connection_is_reported() {
    let (client, mut server) = tokio::io::duplex(64);
    drop(client);
    assert!(matches!(
        read_message(&mut server).await,
        Err(ProtocolError::ConnectionClosed)
    ));
}
