//! Client-side room data model.
//!
//! These are the coordinator's own types, distinct from the wire types in
//! `lockstep-protocol`: a playing medium stores its start time in the *local
//! monotonic* domain, translated from the server reference domain exactly
//! once, at the wire boundary.

use crate::clock::{LocalTime, Offset};
use std::time::Duration;

/// A participant.  Equality compares ids only; the display name is
/// presentation data.
#[derive(Debug, Clone, Eq)]
pub struct PeerIdentity {
    pub id: u64,
    pub name: String,
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl From<lockstep_protocol::PeerInfo> for PeerIdentity {
    fn from(info: lockstep_protocol::PeerInfo) -> Self {
        Self {
            id: info.id,
            name: info.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing {
        /// Local monotonic instant at which position 0 would have played.
        local_start_time: LocalTime,
    },
    Paused {
        position: Duration,
    },
}

impl PlaybackState {
    fn from_wire(wire: lockstep_protocol::PlaybackState, offset: Offset) -> Self {
        match wire {
            lockstep_protocol::PlaybackState::Playing {
                start_time_in_milliseconds,
            } => PlaybackState::Playing {
                local_start_time: offset.server_to_local(start_time_in_milliseconds),
            },
            lockstep_protocol::PlaybackState::Paused {
                position_in_milliseconds,
            } => PlaybackState::Paused {
                position: Duration::from_millis(position_in_milliseconds),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthMedium {
    pub name: String,
    pub length: Duration,
    pub playback_skipped: bool,
    pub state: PlaybackState,
}

impl FixedLengthMedium {
    /// A freshly inserted medium: paused at position 0, nothing skipped.
    pub fn new(name: impl Into<String>, length: Duration) -> Self {
        Self {
            name: name.into(),
            length,
            playback_skipped: false,
            state: PlaybackState::Paused {
                position: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Medium {
    Empty,
    FixedLength(FixedLengthMedium),
}

/// The medium tagged with the server's linearization counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedMedium {
    pub version: u64,
    pub medium: Medium,
}

impl VersionedMedium {
    /// Translate an authoritative wire medium into the local model,
    /// converting a playing start time out of the server reference domain.
    pub fn from_wire(wire: lockstep_protocol::VersionedMedium, offset: Offset) -> Self {
        match wire {
            lockstep_protocol::VersionedMedium::Empty { version } => Self {
                version,
                medium: Medium::Empty,
            },
            lockstep_protocol::VersionedMedium::FixedLength {
                version,
                name,
                length_in_milliseconds,
                playback_skipped,
                playback_state,
            } => Self {
                version,
                medium: Medium::FixedLength(FixedLengthMedium {
                    name,
                    length: Duration::from_millis(length_in_milliseconds),
                    playback_skipped,
                    state: PlaybackState::from_wire(playback_state, offset),
                }),
            },
        }
    }
}
