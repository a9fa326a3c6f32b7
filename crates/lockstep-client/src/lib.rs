//! Client library for the synchronized-playback service.
//!
//! The layers, leaves first: [`broker`] (typed fan-out), [`rate_limiter`]
//! (burst collapsing), [`deadline`] (future-with-timeout), [`transport`]
//! (WebSocket connect), [`connection`] (request/response correlation and
//! broadcast routing), [`reference_time`] (clock-offset estimation),
//! [`coordinator`] (the room model), and [`player`] (driving a media sink).

pub mod broker;
pub mod clock;
pub mod connection;
pub mod coordinator;
pub mod deadline;
pub mod medium;
pub mod player;
pub mod rate_limiter;
pub mod reference_time;
pub mod transport;

pub use broker::{Broker, Subscription};
pub use clock::{LocalTime, Offset};
pub use connection::{
    CloseReason, Connection, ConnectionDelegate, EnrichedResponse, ProtocolViolation,
    RequestError, ResponseMetadata,
};
pub use coordinator::{
    ChatMessage, LeftReason, MediumEvent, PeerLifecycleEvent, RegisterError, RoomCoordinator,
};
pub use medium::{FixedLengthMedium, Medium, PeerIdentity, PlaybackState, VersionedMedium};
pub use player::{MediaSink, PlayerCoordinator, PlayerLoadError};
pub use rate_limiter::RateLimiter;
pub use reference_time::{ReferenceTimeSynchronizer, SyncError};
pub use transport::{ConnectError, connect, connect_with_timeout};
