//! Room state coordinator: the registered client.
//!
//! Holds the client-side model of the shared room (peers, versioned medium)
//! and keeps it converged with the server: user-initiated mutations apply an
//! optimistic local update after the ack, authoritative broadcasts replace
//! state wholesale, and the two are reconciled by comparing medium versions.
//! Interested parties (UI) subscribe through three brokers: peer lifecycle,
//! chat, medium changes.

use crate::broker::{Broker, Subscription};
use crate::clock::LocalTime;
use crate::connection::{
    CloseReason, Connection, ConnectionDelegate, EnrichedResponse, ProtocolViolation,
    RequestError,
};
use crate::medium::{FixedLengthMedium, Medium, PeerIdentity, PlaybackState, VersionedMedium};
use crate::reference_time::{ReferenceTimeSynchronizer, SyncError};
use lockstep_protocol::{
    Broadcast, ChatBroadcast, ClientJoined, ClientLeft, ClientRequest, MediumSpec,
    MediumStateChanged, ServerFrame, SuccessMessage,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a peer left, as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeftReason {
    Closed,
    Timeout,
}

impl From<lockstep_protocol::LeaveReason> for LeftReason {
    fn from(reason: lockstep_protocol::LeaveReason) -> Self {
        match reason {
            lockstep_protocol::LeaveReason::Closed => LeftReason::Closed,
            lockstep_protocol::LeaveReason::Timeout => LeftReason::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLifecycleEvent {
    Joined(PeerIdentity),
    Left {
        peer: PeerIdentity,
        reason: LeftReason,
    },
    /// Membership rebuilt wholesale (our own join echo carries the full list).
    Refreshed {
        peers: Vec<PeerIdentity>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: PeerIdentity,
    pub message: String,
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediumEvent {
    /// Our own optimistic mutation was acknowledged and installed.
    ChangedByOurself { medium: VersionedMedium },
    /// A peer changed the authoritative medium.
    ChangedByPeer {
        changer: PeerIdentity,
        medium: VersionedMedium,
    },
    /// The clock offset moved while a medium was playing; its local start
    /// time was rewritten by `delta_ms`.
    TimeAdjusted {
        medium: VersionedMedium,
        delta_ms: i64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("expected a hello response to register")]
    UnexpectedResponse,
}

// ---------------------------------------------------------------------------
// Room state and its reconciliation rules
// ---------------------------------------------------------------------------

struct RoomState {
    peers: Vec<PeerIdentity>,
    medium: VersionedMedium,
}

enum JoinOutcome {
    Refreshed(Vec<PeerIdentity>),
    Joined(PeerIdentity),
}

impl RoomState {
    fn apply_client_joined(&mut self, self_id: u64, joined: ClientJoined) -> JoinOutcome {
        if joined.id == self_id {
            let peers: Vec<PeerIdentity> = joined
                .participants
                .into_iter()
                .filter(|participant| participant.id != self_id)
                .map(PeerIdentity::from)
                .collect();
            self.peers = peers.clone();
            JoinOutcome::Refreshed(peers)
        } else {
            let peer = PeerIdentity {
                id: joined.id,
                name: joined.name,
            };
            match self.peers.iter_mut().find(|known| known.id == peer.id) {
                Some(known) => known.name = peer.name.clone(),
                None => self.peers.push(peer.clone()),
            }
            JoinOutcome::Joined(peer)
        }
    }

    fn apply_client_left(&mut self, left: &ClientLeft) -> Option<PeerIdentity> {
        let index = self.peers.iter().position(|peer| peer.id == left.id)?;
        Some(self.peers.remove(index))
    }

    /// Install the optimistic post-ack update, unless a broadcast advanced
    /// the version past the tentative one during the await.
    ///
    /// The server accepted the mutation against `previous_version`, so
    /// version `previous_version + 1` is necessarily our own change; seeing
    /// it already installed means only our own echo won the race, and the
    /// optimistic notification is still owed.  Anything newer is a foreign
    /// overtake and discards the tentative update.
    fn install_tentative(
        &mut self,
        previous_version: u64,
        medium: Medium,
    ) -> Option<VersionedMedium> {
        if self.medium.version > previous_version + 1 {
            debug!(
                tentative = previous_version + 1,
                current = self.medium.version,
                "optimistic update overtaken by broadcast"
            );
            return None;
        }
        self.medium = VersionedMedium {
            version: previous_version + 1,
            medium,
        };
        Some(self.medium.clone())
    }

    /// Shift a playing medium's local start time by `delta_ms`.
    fn adjust_playing_start(&mut self, delta_ms: i64) -> Option<VersionedMedium> {
        let Medium::FixedLength(fixed) = &mut self.medium.medium else {
            return None;
        };
        let PlaybackState::Playing { local_start_time } = &mut fixed.state else {
            return None;
        };
        *local_start_time = *local_start_time + delta_ms;
        Some(self.medium.clone())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

type DisconnectCallback = Box<dyn FnOnce(CloseReason) + Send>;

pub struct RoomCoordinator {
    connection: Arc<Connection>,
    time_sync: ReferenceTimeSynchronizer,
    self_id: u64,
    name: String,
    state: Mutex<RoomState>,
    peer_events: Broker<PeerLifecycleEvent>,
    chat_events: Broker<ChatMessage>,
    medium_events: Broker<MediumEvent>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl RoomCoordinator {
    /// Register `name` with the server and return the live coordinator.
    ///
    /// The sequence matters: one awaited reference-time sample first (the
    /// hello's medium must be translated with a known offset), then the
    /// `register` request, then periodic sampling and delegate attachment.
    /// Broadcasts arriving in between are buffered by the connection and
    /// replayed once the coordinator attaches.
    pub async fn register(
        connection: Arc<Connection>,
        name: impl Into<String>,
        on_disconnect: impl FnOnce(CloseReason) + Send + 'static,
    ) -> Result<Arc<Self>, RegisterError> {
        let name = name.into();
        let time_sync = ReferenceTimeSynchronizer::create_initialized(Arc::clone(&connection)).await?;

        let response = connection
            .perform_request(ClientRequest::Register { name: name.clone() })
            .await?;
        let SuccessMessage::Hello(hello) = response.message else {
            return Err(RegisterError::UnexpectedResponse);
        };

        let offset = time_sync.offset();
        let peers = hello
            .clients
            .into_iter()
            .filter(|client| client.id != hello.id)
            .map(PeerIdentity::from)
            .collect();
        let medium = VersionedMedium::from_wire(hello.current_medium, offset);
        debug!(id = hello.id, name = %name, version = medium.version, "registered");

        let coordinator = Arc::new(Self {
            connection: Arc::clone(&connection),
            time_sync,
            self_id: hello.id,
            name,
            state: Mutex::new(RoomState { peers, medium }),
            peer_events: Broker::new(),
            chat_events: Broker::new(),
            medium_events: Broker::new(),
            on_disconnect: Mutex::new(Some(Box::new(on_disconnect))),
        });

        let weak = Arc::downgrade(&coordinator);
        coordinator.time_sync.start(move |delta| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.handle_offset_change(delta);
            }
        })?;
        connection.set_delegate(Arc::clone(&coordinator) as Arc<dyn ConnectionDelegate>);

        Ok(coordinator)
    }

    pub fn as_peer(&self) -> PeerIdentity {
        PeerIdentity {
            id: self.self_id,
            name: self.name.clone(),
        }
    }

    /// Peers currently in the room, excluding ourself.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.state.lock().unwrap().peers.clone()
    }

    pub fn current_medium(&self) -> VersionedMedium {
        self.state.lock().unwrap().medium.clone()
    }

    pub fn subscribe_to_peer_changes(
        &self,
        handler: impl Fn(&PeerLifecycleEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.peer_events.subscribe(handler)
    }

    pub fn subscribe_to_chat_messages(
        &self,
        handler: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.chat_events.subscribe(handler)
    }

    pub fn subscribe_to_medium_changes(
        &self,
        handler: impl Fn(&MediumEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.medium_events.subscribe(handler)
    }

    /// Send a chat line; resolves on the server ack.  Our own echo broadcast
    /// is suppressed during reconciliation.
    pub async fn send_chat_message(&self, message: impl Into<String>) -> Result<(), RequestError> {
        let response = self
            .connection
            .perform_request(ClientRequest::Chat {
                message: message.into(),
            })
            .await?;
        expect_bare_success(response)
    }

    /// Insert a fixed-length medium, optimistically installing
    /// `(version + 1, paused at 0)` once acknowledged.
    pub async fn insert_fixed_length_medium(
        &self,
        name: impl Into<String>,
        length: Duration,
    ) -> Result<(), RequestError> {
        let name = name.into();
        let medium = Medium::FixedLength(FixedLengthMedium::new(name.clone(), length));
        let spec = MediumSpec::FixedLength {
            name,
            length_in_milliseconds: u64::try_from(length.as_millis()).unwrap_or(u64::MAX),
        };
        self.mutate_medium(spec, medium).await
    }

    /// Eject the current medium, optimistically installing
    /// `(version + 1, empty)` once acknowledged.
    pub async fn eject_medium(&self) -> Result<(), RequestError> {
        self.mutate_medium(MediumSpec::Empty, Medium::Empty).await
    }

    async fn mutate_medium(&self, spec: MediumSpec, tentative: Medium) -> Result<(), RequestError> {
        let previous_version = self.state.lock().unwrap().medium.version;
        let response = self
            .connection
            .perform_request(ClientRequest::InsertMedium {
                previous_version,
                medium: spec,
            })
            .await?;
        expect_bare_success(response)?;

        let installed = self
            .state
            .lock()
            .unwrap()
            .install_tentative(previous_version, tentative);
        if let Some(medium) = installed {
            self.medium_events
                .notify(&MediumEvent::ChangedByOurself { medium });
        }
        Ok(())
    }

    /// Start playback from `local_start_time` (the local monotonic instant at
    /// which position 0 plays), translated to server time on the wire.
    pub async fn play(&self, local_start_time: LocalTime, skipped: bool) -> Result<(), RequestError> {
        let previous_version = self.state.lock().unwrap().medium.version;
        let response = self
            .connection
            .perform_request(ClientRequest::Play {
                previous_version,
                skipped,
                start_time_in_milliseconds: self.time_sync.server_time_from_local(local_start_time),
            })
            .await?;
        expect_bare_success(response)
    }

    pub async fn pause(&self, position: Duration, skipped: bool) -> Result<(), RequestError> {
        let previous_version = self.state.lock().unwrap().medium.version;
        let response = self
            .connection
            .perform_request(ClientRequest::Pause {
                previous_version,
                skipped,
                position_in_milliseconds: u64::try_from(position.as_millis()).unwrap_or(u64::MAX),
            })
            .await?;
        expect_bare_success(response)
    }

    /// Leave the room by closing the session.
    pub async fn logout(&self) {
        self.connection.disconnect().await;
    }

    // -----------------------------------------------------------------------
    // Broadcast reconciliation
    // -----------------------------------------------------------------------

    fn handle_client_joined(&self, joined: ClientJoined) {
        if joined.id == self.self_id && joined.name != self.name {
            warn!(name = %joined.name, "join echo carries a different name than ours");
        }
        let outcome = self
            .state
            .lock()
            .unwrap()
            .apply_client_joined(self.self_id, joined);
        match outcome {
            JoinOutcome::Refreshed(peers) => {
                self.peer_events
                    .notify(&PeerLifecycleEvent::Refreshed { peers });
            }
            JoinOutcome::Joined(peer) => {
                self.peer_events.notify(&PeerLifecycleEvent::Joined(peer));
            }
        }
    }

    fn handle_client_left(&self, left: ClientLeft) {
        let removed = self.state.lock().unwrap().apply_client_left(&left);
        match removed {
            Some(peer) => self.peer_events.notify(&PeerLifecycleEvent::Left {
                peer,
                reason: left.reason.into(),
            }),
            None => warn!(id = left.id, name = %left.name, "client_left for unknown peer"),
        }
    }

    fn handle_chat(&self, chat: ChatBroadcast) {
        if chat.sender_id == self.self_id {
            // We authored it; the ack already told the caller.
            return;
        }
        self.chat_events.notify(&ChatMessage {
            sender: PeerIdentity {
                id: chat.sender_id,
                name: chat.sender_name,
            },
            message: chat.message,
            counter: chat.counter,
        });
    }

    fn handle_medium_state_changed(&self, changed: MediumStateChanged) {
        let medium = VersionedMedium::from_wire(changed.medium, self.time_sync.offset());
        self.state.lock().unwrap().medium = medium.clone();
        if changed.changed_by_id == self.self_id {
            // Authoritative state still replaces ours, but the optimistic
            // notification already covered the change.
            return;
        }
        self.medium_events.notify(&MediumEvent::ChangedByPeer {
            changer: PeerIdentity {
                id: changed.changed_by_id,
                name: changed.changed_by_name,
            },
            medium,
        });
    }

    /// Unknown broadcast types signal protocol drift and are fatal: report
    /// the disconnect and tear the session down.
    fn handle_unknown_broadcast(&self) {
        error!("unknown broadcast type from server; closing the session");
        self.time_sync.stop();
        if let Some(callback) = self.on_disconnect.lock().unwrap().take() {
            callback(CloseReason::Error);
        }
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            connection.disconnect().await;
        });
    }

    fn handle_offset_change(&self, delta_ms: i64) {
        let adjusted = self.state.lock().unwrap().adjust_playing_start(delta_ms);
        if let Some(medium) = adjusted {
            self.medium_events
                .notify(&MediumEvent::TimeAdjusted { medium, delta_ms });
        }
    }
}

impl ConnectionDelegate for RoomCoordinator {
    fn broadcast_received(&self, broadcast: Broadcast) {
        match broadcast {
            Broadcast::ClientJoined(joined) => self.handle_client_joined(joined),
            Broadcast::ClientLeft(left) => self.handle_client_left(left),
            Broadcast::Chat(chat) => self.handle_chat(chat),
            Broadcast::MediumStateChanged(changed) => self.handle_medium_state_changed(changed),
            Broadcast::Unknown => self.handle_unknown_broadcast(),
        }
    }

    fn unassignable_response_received(&self, frame: ServerFrame) {
        warn!(?frame, "response matched no pending request");
    }

    fn connection_closed(&self, reason: CloseReason) {
        debug!(?reason, "session closed");
        self.time_sync.stop();
        if let Some(callback) = self.on_disconnect.lock().unwrap().take() {
            callback(reason);
        }
    }

    fn protocol_violation(&self, violation: ProtocolViolation) {
        warn!(%violation, "protocol violation");
    }
}

fn expect_bare_success(response: EnrichedResponse) -> Result<(), RequestError> {
    match response.message {
        SuccessMessage::Success => Ok(()),
        other => Err(RequestError::Shape(format!(
            "expected a bare success, got {other:?}"
        ))),
    }
}
