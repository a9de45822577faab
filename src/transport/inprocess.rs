//! In-memory [`EventTransport`] backed by per-connection unbounded `mpsc`
//! channels, the same fan-out shape the teacher's `net::connection` uses for
//! its per-socket write task — minus the actual socket. Used by the
//! websocket bootstrap's test suite and by anything embedding the gateway
//! without a real network.
use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::ids::GameCode;

use super::{ConnectionId, EventTransport, OutboundEvent};

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<OutboundEvent>>,
    rooms: HashMap<GameCode, HashSet<ConnectionId>>,
}

pub struct InProcessTransport {
    inner: RwLock<Inner>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }

    /// Registers a connection and returns the receiver its write loop
    /// should drain.
    pub fn register(&self, conn_id: ConnectionId) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().connections.insert(conn_id, tx);
        rx
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTransport for InProcessTransport {
    fn send_to(&self, conn_id: ConnectionId, event: OutboundEvent) {
        if let Some(tx) = self.inner.read().connections.get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    fn broadcast(&self, room: &GameCode, event: OutboundEvent) {
        let inner = self.inner.read();
        let Some(members) = inner.rooms.get(room) else { return };
        for conn_id in members {
            if let Some(tx) = inner.connections.get(conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn broadcast_except(&self, room: &GameCode, except: ConnectionId, event: OutboundEvent) {
        let inner = self.inner.read();
        let Some(members) = inner.rooms.get(room) else { return };
        for conn_id in members {
            if *conn_id == except {
                continue;
            }
            if let Some(tx) = inner.connections.get(conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn join_room(&self, conn_id: ConnectionId, room: GameCode) {
        self.inner.write().rooms.entry(room).or_default().insert(conn_id);
    }

    fn leave_room(&self, conn_id: ConnectionId, room: &GameCode) {
        if let Some(members) = self.inner.write().rooms.get_mut(room) {
            members.remove(&conn_id);
        }
    }

    fn disconnect(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.write();
        inner.connections.remove(&conn_id);
        for members in inner.rooms.values_mut() {
            members.remove(&conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_reaches_every_room_member() {
        let transport = InProcessTransport::new();
        let mut rx1 = transport.register(1);
        let mut rx2 = transport.register(2);
        let room = GameCode::canonicalize("abcdef");
        transport.join_room(1, room.clone());
        transport.join_room(2, room.clone());

        transport.broadcast(&room, OutboundEvent::new("game:state", json!({"ok": true})));

        assert_eq!(rx1.recv().await.unwrap().event, "game:state");
        assert_eq!(rx2.recv().await.unwrap().event, "game:state");
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_excluded_connection() {
        let transport = InProcessTransport::new();
        let mut rx1 = transport.register(1);
        let mut rx2 = transport.register(2);
        let room = GameCode::canonicalize("abcdef");
        transport.join_room(1, room.clone());
        transport.join_room(2, room.clone());

        transport.broadcast_except(&room, 1, OutboundEvent::new("game:state", json!({})));

        assert!(rx2.recv().await.is_some());
        transport.disconnect(1);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_room_membership() {
        let transport = InProcessTransport::new();
        let mut rx2 = transport.register(2);
        let room = GameCode::canonicalize("abcdef");
        transport.join_room(2, room.clone());
        transport.disconnect(2);
        transport.broadcast(&room, OutboundEvent::new("game:state", json!({})));
        assert!(rx2.try_recv().is_err());
    }
}
