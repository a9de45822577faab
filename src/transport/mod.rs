//! The gateway talks to connections through this trait rather than a
//! concrete socket library, so the real transport (websockets, rooms, acks)
//! stays a swappable collaborator — see [`inprocess`] for the reference
//! implementation the test suite and scenarios run against.
pub mod inprocess;

use serde_json::Value;

use crate::ids::GameCode;

/// A connected client, identified the way the gateway addresses it: never
/// by raw socket id, always by the session id the gateway assigned on
/// connect.
pub type ConnectionId = u64;

/// One outbound event: a name and a JSON payload, matching the wire
/// contract's `{event, payload}` envelope.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event: &'static str,
    pub payload: Value,
}

impl OutboundEvent {
    pub fn new(event: &'static str, payload: Value) -> Self {
        Self { event, payload }
    }
}

/// Room membership for a connection is exactly one game's code; a
/// connection not yet joined to a game is in no room.
pub trait EventTransport: Send + Sync {
    /// Sends an event to one connection only.
    fn send_to(&self, conn_id: ConnectionId, event: OutboundEvent);

    /// Broadcasts an event to every connection in a game's room.
    fn broadcast(&self, room: &GameCode, event: OutboundEvent);

    /// Broadcasts to every connection in the room except one (e.g. the
    /// player whose own action already got a direct reply).
    fn broadcast_except(&self, room: &GameCode, except: ConnectionId, event: OutboundEvent);

    /// Adds a connection to a room. Idempotent.
    fn join_room(&self, conn_id: ConnectionId, room: GameCode);

    /// Removes a connection from a room. Idempotent.
    fn leave_room(&self, conn_id: ConnectionId, room: &GameCode);

    /// Tears down all room membership for a connection, e.g. on disconnect.
    fn disconnect(&self, conn_id: ConnectionId);
}
