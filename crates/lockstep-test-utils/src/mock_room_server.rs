// mock_room_server: A mock coordinating server for testing the client.
//
// Accepts connections on ws://localhost:<port>, validates the token query
// parameter when configured, and implements enough of the room protocol to
// exercise the full client stack: register -> hello, chat, medium mutations
// with version checks, reference time, and broadcasts to every session.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lockstep_protocol::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

struct RoomInner {
    next_peer_id: u64,
    peers: Vec<PeerInfo>,
    medium: VersionedMedium,
    chat_counter: u64,
    /// Scripted server clock, returned verbatim by `get_reference_time`.
    reference_time_ms: i64,
    /// When set, incoming requests are ignored entirely (for deadline tests).
    silent: bool,
    /// When set, success/error replies are delayed by this much while
    /// broadcasts keep flowing (for optimistic-overtake tests).
    reply_delay: Option<Duration>,
    /// Query string of the most recent WebSocket upgrade.
    last_query: Option<String>,
    sessions: Vec<mpsc::UnboundedSender<Message>>,
}

type SharedRoom = Arc<Mutex<RoomInner>>;

/// A mock room server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port.  Each test
/// can spin up its own isolated server instance.
pub struct MockRoomServer {
    addr: SocketAddr,
    room: SharedRoom,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockRoomServer {
    /// Start the mock server without token enforcement.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_inner(None).await
    }

    /// Start the mock server; upgrades without `token=<token>` in the query
    /// are rejected with 401.
    pub async fn start_with_token(token: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_inner(Some(token.to_owned())).await
    }

    async fn start_inner(
        expected_token: Option<String>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let room: SharedRoom = Arc::new(Mutex::new(RoomInner {
            next_peer_id: 1,
            peers: Vec::new(),
            medium: VersionedMedium::Empty { version: 0 },
            chat_counter: 0,
            reference_time_ms: 1_000_000,
            silent: false,
            reply_delay: None,
            last_query: None,
            sessions: Vec::new(),
        }));

        let accept_room = Arc::clone(&room);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let room = Arc::clone(&accept_room);
                        let expected_token = expected_token.clone();
                        tokio::spawn(async move {
                            // Client drops are expected in tests; swallow errors.
                            let _ = handle_connection(stream, room, expected_token).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            room,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Set the value returned by subsequent `get_reference_time` requests.
    pub fn set_reference_time(&self, milliseconds: i64) {
        self.room.lock().unwrap().reference_time_ms = milliseconds;
    }

    /// When silent, the server reads requests but never answers them.
    pub fn set_silent(&self, silent: bool) {
        self.room.lock().unwrap().silent = silent;
    }

    /// Delay request replies while letting broadcasts through immediately.
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.room.lock().unwrap().reply_delay = delay;
    }

    /// Push a broadcast to every connected session.
    pub fn broadcast(&self, broadcast: Broadcast) {
        let frame = broadcast_frame(&broadcast);
        self.room.lock().unwrap().push_to_all(frame);
    }

    /// Push an arbitrary text frame to every connected session.
    pub fn send_raw_to_all(&self, text: &str) {
        self.room
            .lock()
            .unwrap()
            .push_to_all(Message::Text(text.to_owned().into()));
    }

    /// Push a binary frame to every connected session (the protocol is
    /// text-only; clients must flag this).
    pub fn send_binary_to_all(&self, payload: Vec<u8>) {
        self.room
            .lock()
            .unwrap()
            .push_to_all(Message::Binary(payload.into()));
    }

    /// Number of currently connected sessions.
    pub fn session_count(&self) -> usize {
        self.room.lock().unwrap().sessions.len()
    }

    /// Close every session cleanly, as a server-side kick would.
    pub fn close_all_sessions(&self) {
        self.room.lock().unwrap().push_to_all(Message::Close(None));
    }

    /// Query string of the most recent upgrade request.
    pub fn last_query(&self) -> Option<String> {
        self.room.lock().unwrap().last_query.clone()
    }

    pub fn current_medium(&self) -> VersionedMedium {
        self.room.lock().unwrap().medium.clone()
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.room
            .lock()
            .unwrap()
            .peers
            .iter()
            .map(|peer| peer.name.clone())
            .collect()
    }
}

impl RoomInner {
    fn push_to_all(&mut self, message: Message) {
        self.sessions
            .retain(|session| session.send(message.clone()).is_ok());
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    room: SharedRoom,
    expected_token: Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let check_room = Arc::clone(&room);
    let callback = move |request: &Request, response: Response| {
        let query = request.uri().query().unwrap_or("").to_owned();
        check_room.lock().unwrap().last_query = Some(query.clone());
        if let Some(expected) = &expected_token {
            let authorized = query
                .split('&')
                .any(|pair| pair == format!("token={expected}"));
            if !authorized {
                let mut reject = ErrorResponse::new(Some("invalid token".to_owned()));
                *reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
                return Err(reject);
            }
        }
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws.split();

    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    room.lock().unwrap().sessions.push(session_tx.clone());
    let mut registered: Option<PeerInfo> = None;

    loop {
        tokio::select! {
            outgoing = session_rx.recv() => match outgoing {
                Some(message) => {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = read.next() => match incoming {
                None => break,
                Some(Err(_)) => break,
                Some(Ok(Message::Text(text))) => {
                    if room.lock().unwrap().silent {
                        continue;
                    }
                    let reply = match serde_json::from_str::<RequestEnvelope>(&text) {
                        Ok(envelope) => handle_request(&room, &mut registered, envelope),
                        Err(e) => error_frame(None, ErrorCode::InvalidFormat, &e.to_string()),
                    };
                    let delay = room.lock().unwrap().reply_delay;
                    match delay {
                        // The delayed reply goes through the session queue so
                        // broadcasts keep flowing in the meantime.
                        Some(delay) => {
                            let tx = session_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send(reply);
                            });
                        }
                        None => {
                            if write.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    if let Some(peer) = registered {
        let mut inner = room.lock().unwrap();
        inner.peers.retain(|known| known.id != peer.id);
        let frame = broadcast_frame(&Broadcast::ClientLeft(ClientLeft {
            id: peer.id,
            name: peer.name,
            reason: LeaveReason::Closed,
        }));
        inner.push_to_all(frame);
    }
    Ok(())
}

fn handle_request(
    room: &SharedRoom,
    registered: &mut Option<PeerInfo>,
    envelope: RequestEnvelope,
) -> Message {
    let request_id = envelope.request_id;
    let mut inner = room.lock().unwrap();
    match envelope.request {
        ClientRequest::Register { name } => {
            let id = inner.next_peer_id;
            inner.next_peer_id += 1;
            let peer = PeerInfo {
                id,
                name: name.clone(),
            };
            inner.peers.push(peer.clone());
            *registered = Some(peer);

            let joined = broadcast_frame(&Broadcast::ClientJoined(ClientJoined {
                id,
                name,
                participants: inner.peers.clone(),
            }));
            inner.push_to_all(joined);

            success_frame(
                request_id,
                SuccessMessage::Hello(Hello {
                    id,
                    clients: inner.peers.clone(),
                    current_medium: inner.medium.clone(),
                }),
            )
        }
        ClientRequest::Chat { message } => {
            if message.trim().is_empty() {
                return error_frame(
                    Some(request_id),
                    ErrorCode::EmptyChatMessage,
                    "chat message is empty",
                );
            }
            let Some(sender) = registered.clone() else {
                return error_frame(
                    Some(request_id),
                    ErrorCode::InvalidOperation,
                    "not registered",
                );
            };
            inner.chat_counter += 1;
            let chat = broadcast_frame(&Broadcast::Chat(ChatBroadcast {
                sender_id: sender.id,
                sender_name: sender.name,
                message,
                counter: inner.chat_counter,
            }));
            inner.push_to_all(chat);
            success_frame(request_id, SuccessMessage::Success)
        }
        ClientRequest::InsertMedium {
            previous_version,
            medium,
        } => {
            if previous_version != inner.medium.version() {
                return version_conflict(request_id, inner.medium.version());
            }
            let next = match medium {
                MediumSpec::Empty => VersionedMedium::Empty {
                    version: previous_version + 1,
                },
                MediumSpec::FixedLength {
                    name,
                    length_in_milliseconds,
                } => VersionedMedium::FixedLength {
                    version: previous_version + 1,
                    name,
                    length_in_milliseconds,
                    playback_skipped: false,
                    playback_state: PlaybackState::Paused {
                        position_in_milliseconds: 0,
                    },
                },
            };
            apply_medium(&mut inner, registered, next);
            success_frame(request_id, SuccessMessage::Success)
        }
        ClientRequest::Play {
            previous_version,
            skipped,
            start_time_in_milliseconds,
        } => {
            if previous_version != inner.medium.version() {
                return version_conflict(request_id, inner.medium.version());
            }
            match inner.medium.clone() {
                VersionedMedium::Empty { .. } => error_frame(
                    Some(request_id),
                    ErrorCode::InvalidOperation,
                    "no medium to play",
                ),
                VersionedMedium::FixedLength {
                    name,
                    length_in_milliseconds,
                    ..
                } => {
                    apply_medium(
                        &mut inner,
                        registered,
                        VersionedMedium::FixedLength {
                            version: previous_version + 1,
                            name,
                            length_in_milliseconds,
                            playback_skipped: skipped,
                            playback_state: PlaybackState::Playing {
                                start_time_in_milliseconds,
                            },
                        },
                    );
                    success_frame(request_id, SuccessMessage::Success)
                }
            }
        }
        ClientRequest::Pause {
            previous_version,
            skipped,
            position_in_milliseconds,
        } => {
            if previous_version != inner.medium.version() {
                return version_conflict(request_id, inner.medium.version());
            }
            match inner.medium.clone() {
                VersionedMedium::Empty { .. } => error_frame(
                    Some(request_id),
                    ErrorCode::InvalidOperation,
                    "no medium to pause",
                ),
                VersionedMedium::FixedLength {
                    name,
                    length_in_milliseconds,
                    ..
                } => {
                    apply_medium(
                        &mut inner,
                        registered,
                        VersionedMedium::FixedLength {
                            version: previous_version + 1,
                            name,
                            length_in_milliseconds,
                            playback_skipped: skipped,
                            playback_state: PlaybackState::Paused {
                                position_in_milliseconds,
                            },
                        },
                    );
                    success_frame(request_id, SuccessMessage::Success)
                }
            }
        }
        ClientRequest::GetReferenceTime => success_frame(
            request_id,
            SuccessMessage::ReferenceTime {
                milliseconds: inner.reference_time_ms,
            },
        ),
    }
}

fn apply_medium(inner: &mut RoomInner, registered: &Option<PeerInfo>, medium: VersionedMedium) {
    inner.medium = medium.clone();
    let changer = registered.clone().unwrap_or(PeerInfo {
        id: 0,
        name: "server".to_owned(),
    });
    let frame = broadcast_frame(&Broadcast::MediumStateChanged(MediumStateChanged {
        changed_by_id: changer.id,
        changed_by_name: changer.name,
        medium,
    }));
    inner.push_to_all(frame);
}

fn version_conflict(request_id: u64, current: u64) -> Message {
    error_frame(
        Some(request_id),
        ErrorCode::IncorrectMediumVersion,
        &format!("medium is at version {current}"),
    )
}

// ---------------------------------------------------------------------------
// Frame constructors
// ---------------------------------------------------------------------------

fn success_frame(request_id: u64, message: SuccessMessage) -> Message {
    let frame = ServerFrame::Success {
        request_id,
        message,
    };
    Message::Text(serde_json::to_string(&frame).expect("serializable frame").into())
}

fn error_frame(request_id: Option<u64>, error: ErrorCode, message: &str) -> Message {
    let frame = ServerFrame::Error {
        request_id,
        message: ErrorPayload {
            error,
            message: message.to_owned(),
        },
    };
    Message::Text(serde_json::to_string(&frame).expect("serializable frame").into())
}

fn broadcast_frame(broadcast: &Broadcast) -> Message {
    let frame = ServerFrame::Broadcast {
        message: broadcast.clone(),
    };
    Message::Text(serde_json::to_string(&frame).expect("serializable frame").into())
}
