// lockstep-protocol: Wire vocabulary for the synchronized-playback protocol.
//
// All frames are JSON text messages with a top-level `type` field used for
// discriminated deserialization.  Client-to-server frames additionally carry a
// `request_id` correlation integer (see `RequestEnvelope`); server-to-client
// frames are one of three envelope kinds: `success`, `error`, `broadcast`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// A participant as the server describes it: numeric id plus display name.
///
/// Carried in `hello.clients` and in `client_joined.participants`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: u64,
    pub name: String,
}

/// The medium together with the server's linearization counter.
///
/// The `version` increases by one for every accepted mutation
/// (`insert_medium`, `play`, `pause`).  Clients echo it back as
/// `previous_version` so the server can reject stale mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum VersionedMedium {
    Empty {
        version: u64,
    },
    FixedLength {
        version: u64,
        name: String,
        length_in_milliseconds: u64,
        playback_skipped: bool,
        playback_state: PlaybackState,
    },
}

impl VersionedMedium {
    /// The linearization counter, regardless of variant.
    pub fn version(&self) -> u64 {
        match self {
            VersionedMedium::Empty { version } | VersionedMedium::FixedLength { version, .. } => {
                *version
            }
        }
    }
}

/// Playback state in the server reference-time domain.
///
/// `start_time_in_milliseconds` is the server-reference instant at which
/// position 0 played; clients translate it into their own monotonic domain
/// using the current clock offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing { start_time_in_milliseconds: i64 },
    Paused { position_in_milliseconds: u64 },
}

/// Medium description inside an `insert_medium` request.
///
/// Unlike [`VersionedMedium`] this carries no version (the request's
/// `previous_version` covers that) and no playback state (a freshly inserted
/// medium always starts paused at position 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum MediumSpec {
    Empty,
    FixedLength {
        name: String,
        length_in_milliseconds: u64,
    },
}

// ---------------------------------------------------------------------------
// Client -> Server requests
// ---------------------------------------------------------------------------

/// All request kinds a client can issue.
///
/// | type                 | expected success  | errors                                |
/// |----------------------|-------------------|---------------------------------------|
/// | `register`           | `hello`           | invalid_format, invalid_operation     |
/// | `chat`               | `success`         | empty_chat_message, invalid_format    |
/// | `insert_medium`      | `success`         | incorrect_medium_version              |
/// | `play`               | `success`         | incorrect_medium_version              |
/// | `pause`              | `success`         | incorrect_medium_version              |
/// | `get_reference_time` | `reference_time`  | —                                     |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest {
    Register {
        name: String,
    },
    Chat {
        message: String,
    },
    InsertMedium {
        previous_version: u64,
        medium: MediumSpec,
    },
    Play {
        previous_version: u64,
        skipped: bool,
        start_time_in_milliseconds: i64,
    },
    Pause {
        previous_version: u64,
        skipped: bool,
        position_in_milliseconds: u64,
    },
    GetReferenceTime,
}

impl ClientRequest {
    /// Stable name of the request kind, for logging and pending-request
    /// bookkeeping.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Register { .. } => "register",
            ClientRequest::Chat { .. } => "chat",
            ClientRequest::InsertMedium { .. } => "insert_medium",
            ClientRequest::Play { .. } => "play",
            ClientRequest::Pause { .. } => "pause",
            ClientRequest::GetReferenceTime => "get_reference_time",
        }
    }
}

/// A request as it goes onto the wire: the request payload flattened together
/// with its correlation id.
///
/// ```json
/// { "type": "chat", "request_id": 7, "message": "hi" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

// ---------------------------------------------------------------------------
// Server -> Client success payloads
// ---------------------------------------------------------------------------

/// Registration acknowledgement: the id the server assigned to us, everyone
/// already in the room, and the authoritative medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub id: u64,
    pub clients: Vec<PeerInfo>,
    pub current_medium: VersionedMedium,
}

/// Payload of a `success` envelope, discriminated by its own `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SuccessMessage {
    Hello(Hello),
    ReferenceTime { milliseconds: i64 },
    Success,
}

// ---------------------------------------------------------------------------
// Server -> Client error payloads
// ---------------------------------------------------------------------------

/// Frozen error codes.
///
/// | code                     | meaning                                        |
/// |--------------------------|------------------------------------------------|
/// | invalid_format           | request did not parse                          |
/// | invalid_operation        | request not valid in the current session state |
/// | internal_server_error    | server-side failure                            |
/// | incorrect_medium_version | mutation raced a newer medium version          |
/// | empty_chat_message       | chat message was empty after trimming          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidFormat,
    InvalidOperation,
    InternalServerError,
    IncorrectMediumVersion,
    EmptyChatMessage,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidFormat => "invalid_format",
            ErrorCode::InvalidOperation => "invalid_operation",
            ErrorCode::InternalServerError => "internal_server_error",
            ErrorCode::IncorrectMediumVersion => "incorrect_medium_version",
            ErrorCode::EmptyChatMessage => "empty_chat_message",
        };
        f.write_str(s)
    }
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorCode,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Server -> Client broadcasts
// ---------------------------------------------------------------------------

/// Why a peer left the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Closed,
    Timeout,
}

/// A peer joined.  `participants` is the full post-join list, used to rebuild
/// the membership wholesale when the joined peer is ourself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoined {
    pub id: u64,
    pub name: String,
    pub participants: Vec<PeerInfo>,
}

/// A peer left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLeft {
    pub id: u64,
    pub name: String,
    pub reason: LeaveReason,
}

/// A chat line.  `counter` is the server's per-room message counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBroadcast {
    pub sender_id: u64,
    pub sender_name: String,
    pub message: String,
    pub counter: u64,
}

/// The authoritative medium changed (insert, eject, play, pause).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumStateChanged {
    pub changed_by_id: u64,
    pub changed_by_name: String,
    pub medium: VersionedMedium,
}

/// Server-initiated messages, not correlated to any outstanding request.
///
/// An unrecognized `type` deserializes to `Unknown` so the session layer can
/// hand it upward instead of treating the frame as malformed; the room
/// coordinator treats `Unknown` as fatal protocol drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Broadcast {
    ClientJoined(ClientJoined),
    ClientLeft(ClientLeft),
    Chat(ChatBroadcast),
    MediumStateChanged(MediumStateChanged),
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Server -> Client envelope
// ---------------------------------------------------------------------------

/// Top-level discriminated union of everything the server sends.
///
/// ```json
/// { "type": "success", "request_id": 3, "message": { "type": "success" } }
/// { "type": "error", "request_id": 3, "message": { "error": "invalid_format", "message": "..." } }
/// { "type": "broadcast", "message": { "type": "chat", ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Success {
        request_id: u64,
        message: SuccessMessage,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: ErrorPayload,
    },
    Broadcast {
        message: Broadcast,
    },
}
