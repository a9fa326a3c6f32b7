// lockstep-test-utils: Shared test utilities for the client suite.
//
// Provides a mock room server implementing the server half of the protocol,
// and a raw protocol-level client for driving servers directly.

pub mod mock_room_server;
pub mod raw_client;

pub use mock_room_server::MockRoomServer;
pub use raw_client::RawRoomClient;
