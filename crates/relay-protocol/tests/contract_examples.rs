//! Contract golden tests: parse representative JSON wire messages, check the
//! decoded fields, serialize back, and verify the JSON survives the round
//! trip (modulo fields the relay fills in).

use relay_protocol::*;

fn round_trip(json_text: &str) -> WsMessage {
    let value: WsMessage =
        serde_json::from_str(json_text).unwrap_or_else(|e| panic!("deserialize failed: {e}"));
    let serialized = serde_json::to_string(&value).expect("serialize");
    let reparsed: WsMessage =
        serde_json::from_str(&serialized).unwrap_or_else(|e| panic!("re-deserialize failed: {e}"));
    assert_eq!(value, reparsed, "round-trip mismatch for {json_text}");
    value
}

#[test]
fn producer_handshake() {
    let msg = round_trip(
        r#"{
            "type": "handshake",
            "clientInfo": {
                "name": "office-desktop",
                "hostname": "office-pc.local",
                "monitors": [
                    {"id": "monitor_0", "index": 0, "name": "DP-1", "width": 2560, "height": 1440},
                    {"id": "monitor_1", "index": 1, "name": "HDMI-1", "width": 1920, "height": 1080}
                ],
                "capabilities": ["capture", "mouse", "keyboard", "region_capture"]
            }
        }"#,
    );
    match msg {
        WsMessage::Handshake(h) => {
            assert_eq!(h.client_info.name, "office-desktop");
            assert_eq!(h.client_info.monitors.len(), 2);
            assert_eq!(h.client_info.monitors[1].id, "monitor_1");
            assert_eq!(h.client_info.hostname.as_deref(), Some("office-pc.local"));
            assert!(h.client_info.user_id.is_none());
        }
        other => panic!("expected handshake, got {other:?}"),
    }
}

#[test]
fn viewer_handshake_without_monitors() {
    let msg = round_trip(r#"{"type": "handshake", "clientInfo": {"name": "web-viewer"}}"#);
    match msg {
        WsMessage::Handshake(h) => {
            assert!(h.client_info.monitors.is_empty());
            assert!(h.client_info.capabilities.is_empty());
        }
        other => panic!("expected handshake, got {other:?}"),
    }
}

#[test]
fn frame_data_inbound_has_no_producer_id() {
    let msg = round_trip(
        r#"{
            "type": "frame_data",
            "monitorId": "monitor_0",
            "frameNumber": 42,
            "frameData": "aGVsbG8gd29ybGQ=",
            "metadata": {"width": 2560, "height": 1440, "format": "jpeg"},
            "timestamp": "2026-08-01T12:00:00Z"
        }"#,
    );
    match msg {
        WsMessage::FrameData(f) => {
            assert!(f.producer_id.is_none());
            assert_eq!(f.monitor_id, "monitor_0");
            assert_eq!(f.frame_number, 42);
            assert_eq!(f.metadata.format, FrameFormat::Jpeg);
        }
        other => panic!("expected frame_data, got {other:?}"),
    }
}

#[test]
fn frame_data_outbound_carries_producer_id() {
    let frame = FrameData {
        producer_id: Some("prod-7".to_owned()),
        monitor_id: "monitor_1".to_owned(),
        frame_number: 9,
        frame_data: "cGF5bG9hZA==".to_owned(),
        metadata: FrameMetadata {
            width: 1920,
            height: 1080,
            format: FrameFormat::Png,
        },
        timestamp: None,
    };
    let json = serde_json::to_value(WsMessage::FrameData(frame)).unwrap();
    assert_eq!(json["type"], "frame_data");
    assert_eq!(json["producerId"], "prod-7");
    assert_eq!(json["metadata"]["format"], "png");
    assert!(json.get("timestamp").is_none());
}

#[test]
fn heartbeat_tolerates_extra_fields() {
    let msg = round_trip(r#"{"type": "heartbeat"}"#);
    assert_eq!(msg, WsMessage::Heartbeat);

    let with_ts: WsMessage =
        serde_json::from_str(r#"{"type": "heartbeat", "timestamp": "2026-08-01T12:00:00Z"}"#)
            .expect("extra fields are ignored");
    assert_eq!(with_ts, WsMessage::Heartbeat);
}

#[test]
fn mouse_click_command_captures_kind_specific_params() {
    let msg = round_trip(
        r#"{
            "type": "mouse_click",
            "desktopClientId": "prod-7",
            "monitorId": "monitor_0",
            "x": 100,
            "y": 200,
            "button": "left"
        }"#,
    );
    let (kind, req) = msg.as_command().expect("mouse_click is a command");
    assert_eq!(kind, CommandKind::MouseClick);
    assert_eq!(req.desktop_client_id, "prod-7");
    assert_eq!(req.monitor_id.as_deref(), Some("monitor_0"));
    assert_eq!(req.params["x"], 100);
    assert_eq!(req.params["y"], 200);
    assert_eq!(req.params["button"], "left");
}

#[test]
fn every_command_kind_parses_from_its_wire_tag() {
    for kind in [
        "start_capture",
        "stop_capture",
        "mouse_click",
        "mouse_move",
        "mouse_drag",
        "scroll",
        "type_text",
        "key_press",
        "hotkey",
        "capture_region",
        "get_mouse_position",
    ] {
        let json = format!(r#"{{"type": "{kind}", "desktopClientId": "p1"}}"#);
        let msg: WsMessage = serde_json::from_str(&json)
            .unwrap_or_else(|e| panic!("command {kind} failed to parse: {e}"));
        let (parsed_kind, _) = msg
            .as_command()
            .unwrap_or_else(|| panic!("{kind} did not map to a command"));
        assert_eq!(parsed_kind.as_str(), kind);
    }
}

#[test]
fn command_envelope_round_trip() {
    let envelope = CommandEnvelope {
        command_id: uuid::Uuid::new_v4(),
        kind: CommandKind::TypeText,
        monitor_id: None,
        params: serde_json::json!({"text": "hello"}),
        idempotency_key: "viewer-1:4:1754049600000".to_owned(),
    };
    let json = serde_json::to_value(WsMessage::Command(envelope.clone())).unwrap();
    assert_eq!(json["type"], "command");
    assert_eq!(json["kind"], "type_text");
    assert_eq!(json["params"]["text"], "hello");
    let back: WsMessage = serde_json::from_value(json).unwrap();
    assert_eq!(back, WsMessage::Command(envelope));
}

#[test]
fn command_result_statuses() {
    let msg = round_trip(
        r#"{
            "type": "command_result",
            "commandId": "0d9a1c4e-1111-4222-8333-444455556666",
            "status": "failed",
            "error": "expired"
        }"#,
    );
    match msg {
        WsMessage::CommandResult(r) => {
            assert_eq!(r.status, CommandStatus::Failed);
            assert_eq!(r.error.as_deref(), Some("expired"));
        }
        other => panic!("expected command_result, got {other:?}"),
    }
}

#[test]
fn subscribe_wildcard_omits_producer() {
    let msg = round_trip(r#"{"type": "subscribe"}"#);
    match msg {
        WsMessage::Subscribe(s) => {
            assert!(s.producer_id.is_none());
            assert!(s.monitor_id.is_none());
        }
        other => panic!("expected subscribe, got {other:?}"),
    }
}

#[test]
fn frame_ack_wire_shape() {
    let msg = round_trip(
        r#"{
            "type": "frame_ack",
            "producerId": "prod-7",
            "frameNumber": 42,
            "latencyMs": 87
        }"#,
    );
    match msg {
        WsMessage::FrameAck(a) => {
            assert_eq!(a.producer_id, "prod-7");
            assert_eq!(a.latency_ms, 87);
            assert!(a.viewer_id.is_none());
        }
        other => panic!("expected frame_ack, got {other:?}"),
    }
}

#[test]
fn producer_list_serialization() {
    let list = WsMessage::ProducerList(ProducerList {
        producers: vec![ProducerSummary {
            id: "prod-7".to_owned(),
            name: "office-desktop".to_owned(),
            monitors: vec![MonitorInfo {
                id: "monitor_0".to_owned(),
                index: 0,
                name: "DP-1".to_owned(),
                width: 2560,
                height: 1440,
            }],
            connected: true,
            streaming: false,
        }],
    });
    let json = serde_json::to_value(&list).unwrap();
    assert_eq!(json["type"], "producer_list");
    assert_eq!(json["producers"][0]["id"], "prod-7");
    assert_eq!(json["producers"][0]["connected"], true);
    assert_eq!(json["producers"][0]["monitors"][0]["width"], 2560);
}

#[test]
fn handshake_ack_and_registration_failed() {
    let ack = round_trip(
        r#"{"type": "handshake_ack", "clientId": "prod-7", "dbRegistered": true}"#,
    );
    match ack {
        WsMessage::HandshakeAck(a) => {
            assert_eq!(a.client_id, "prod-7");
            assert!(a.db_registered);
        }
        other => panic!("expected handshake_ack, got {other:?}"),
    }

    let failed = round_trip(
        r#"{"type": "registration_failed", "reason": "catalog registration failed"}"#,
    );
    assert!(matches!(failed, WsMessage::RegistrationFailed(_)));
}
