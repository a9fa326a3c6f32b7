/// Contract golden tests: load each JSON example file, deserialize to Rust
/// types, serialize back to JSON, and verify round-trip fidelity.
use lockstep_protocol::{
    Broadcast, ClientRequest, ErrorCode, LeaveReason, MediumSpec, PlaybackState, RequestEnvelope,
    ServerFrame, SuccessMessage, VersionedMedium,
};
use serde::{Serialize, de::DeserializeOwned};

/// Load a JSON example file relative to the workspace root.
///
/// Cargo sets CARGO_MANIFEST_DIR to the crate directory; example files live
/// next to the workspace root, two levels up.
fn load(relative_path: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = std::path::Path::new(manifest_dir)
        .parent()
        .expect("crates/")
        .parent()
        .expect("workspace root");
    let file_path = workspace_root.join(relative_path);
    std::fs::read_to_string(&file_path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", file_path.display(), e))
}

/// Deserialize, re-serialize, and assert the JSON is structurally identical.
fn round_trip<T: Serialize + DeserializeOwned>(relative_path: &str) -> T {
    let json_text = load(relative_path);
    let value: T = serde_json::from_str(&json_text)
        .unwrap_or_else(|e| panic!("Failed to deserialize {relative_path}: {e}"));
    let serialized = serde_json::to_string(&value)
        .unwrap_or_else(|e| panic!("Failed to serialize {relative_path}: {e}"));

    let original_json: serde_json::Value = serde_json::from_str(&json_text).unwrap();
    let roundtrip_json: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(
        original_json, roundtrip_json,
        "Round-trip mismatch for {relative_path}"
    );
    value
}

fn request(relative_path: &str) -> RequestEnvelope {
    round_trip::<RequestEnvelope>(relative_path)
}

fn frame(relative_path: &str) -> ServerFrame {
    round_trip::<ServerFrame>(relative_path)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[test]
fn register_round_trip() {
    let envelope = request("contracts/ws/v1/examples/register.json");
    assert_eq!(envelope.request_id, 0);
    match envelope.request {
        ClientRequest::Register { name } => assert_eq!(name, "alice"),
        other => panic!("expected Register, got {other:?}"),
    }
}

#[test]
fn chat_round_trip() {
    let envelope = request("contracts/ws/v1/examples/chat.json");
    match envelope.request {
        ClientRequest::Chat { message } => assert!(!message.is_empty()),
        other => panic!("expected Chat, got {other:?}"),
    }
}

#[test]
fn insert_medium_round_trip() {
    let envelope = request("contracts/ws/v1/examples/insert_medium.json");
    match envelope.request {
        ClientRequest::InsertMedium {
            previous_version,
            medium,
        } => {
            assert_eq!(previous_version, 0);
            match medium {
                MediumSpec::FixedLength {
                    name,
                    length_in_milliseconds,
                } => {
                    assert!(!name.is_empty());
                    assert!(length_in_milliseconds > 0);
                }
                MediumSpec::Empty => panic!("expected FixedLength medium"),
            }
        }
        other => panic!("expected InsertMedium, got {other:?}"),
    }
}

#[test]
fn eject_medium_round_trip() {
    let envelope = request("contracts/ws/v1/examples/eject_medium.json");
    match envelope.request {
        ClientRequest::InsertMedium { medium, .. } => assert_eq!(medium, MediumSpec::Empty),
        other => panic!("expected InsertMedium, got {other:?}"),
    }
}

#[test]
fn play_round_trip() {
    let envelope = request("contracts/ws/v1/examples/play.json");
    match envelope.request {
        ClientRequest::Play {
            skipped,
            start_time_in_milliseconds,
            ..
        } => {
            assert!(!skipped);
            assert!(start_time_in_milliseconds > 0);
        }
        other => panic!("expected Play, got {other:?}"),
    }
}

#[test]
fn pause_round_trip() {
    let envelope = request("contracts/ws/v1/examples/pause.json");
    match envelope.request {
        ClientRequest::Pause {
            position_in_milliseconds,
            ..
        } => assert_eq!(position_in_milliseconds, 90_500),
        other => panic!("expected Pause, got {other:?}"),
    }
}

#[test]
fn get_reference_time_round_trip() {
    let envelope = request("contracts/ws/v1/examples/get_reference_time.json");
    assert_eq!(envelope.request, ClientRequest::GetReferenceTime);
}

// ---------------------------------------------------------------------------
// Success / error envelopes
// ---------------------------------------------------------------------------

#[test]
fn hello_round_trip() {
    match frame("contracts/ws/v1/examples/success_hello.json") {
        ServerFrame::Success {
            request_id,
            message: SuccessMessage::Hello(hello),
        } => {
            assert_eq!(request_id, 0);
            assert_eq!(hello.id, 42);
            assert_eq!(hello.clients.len(), 2);
            assert_eq!(hello.current_medium.version(), 4);
        }
        other => panic!("expected Hello success, got {other:?}"),
    }
}

#[test]
fn reference_time_round_trip() {
    match frame("contracts/ws/v1/examples/success_reference_time.json") {
        ServerFrame::Success {
            message: SuccessMessage::ReferenceTime { milliseconds },
            ..
        } => assert_eq!(milliseconds, 1337),
        other => panic!("expected ReferenceTime success, got {other:?}"),
    }
}

#[test]
fn bare_success_round_trip() {
    match frame("contracts/ws/v1/examples/success_ack.json") {
        ServerFrame::Success {
            message: SuccessMessage::Success,
            ..
        } => {}
        other => panic!("expected bare success, got {other:?}"),
    }
}

#[test]
fn error_with_request_id_round_trip() {
    match frame("contracts/ws/v1/examples/error_incorrect_medium_version.json") {
        ServerFrame::Error {
            request_id,
            message,
        } => {
            assert_eq!(request_id, Some(5));
            assert_eq!(message.error, ErrorCode::IncorrectMediumVersion);
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[test]
fn error_without_request_id_round_trip() {
    match frame("contracts/ws/v1/examples/error_without_request_id.json") {
        ServerFrame::Error { request_id, .. } => assert_eq!(request_id, None),
        other => panic!("expected Error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Broadcasts
// ---------------------------------------------------------------------------

#[test]
fn client_joined_round_trip() {
    match frame("contracts/ws/v1/examples/broadcast_client_joined.json") {
        ServerFrame::Broadcast {
            message: Broadcast::ClientJoined(joined),
        } => {
            assert_eq!(joined.id, 12);
            // The post-join participant list includes the joined peer itself.
            assert!(joined.participants.iter().any(|p| p.id == joined.id));
        }
        other => panic!("expected ClientJoined broadcast, got {other:?}"),
    }
}

#[test]
fn client_left_round_trip() {
    match frame("contracts/ws/v1/examples/broadcast_client_left.json") {
        ServerFrame::Broadcast {
            message: Broadcast::ClientLeft(left),
        } => assert_eq!(left.reason, LeaveReason::Timeout),
        other => panic!("expected ClientLeft broadcast, got {other:?}"),
    }
}

#[test]
fn chat_broadcast_round_trip() {
    match frame("contracts/ws/v1/examples/broadcast_chat.json") {
        ServerFrame::Broadcast {
            message: Broadcast::Chat(chat),
        } => {
            assert_eq!(chat.sender_id, 7);
            assert_eq!(chat.counter, 23);
        }
        other => panic!("expected Chat broadcast, got {other:?}"),
    }
}

#[test]
fn medium_state_changed_round_trip() {
    match frame("contracts/ws/v1/examples/broadcast_medium_state_changed.json") {
        ServerFrame::Broadcast {
            message: Broadcast::MediumStateChanged(changed),
        } => {
            assert_eq!(changed.changed_by_id, 7);
            match changed.medium {
                VersionedMedium::FixedLength {
                    version,
                    playback_skipped,
                    playback_state,
                    ..
                } => {
                    assert_eq!(version, 5);
                    assert!(playback_skipped);
                    assert!(matches!(playback_state, PlaybackState::Playing { .. }));
                }
                VersionedMedium::Empty { .. } => panic!("expected FixedLength medium"),
            }
        }
        other => panic!("expected MediumStateChanged broadcast, got {other:?}"),
    }
}
