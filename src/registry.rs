//! Connection-to-room registry and message delivery.

use crate::protocol::{Identity, MatchId, ServerMessage};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, RwLock};

/// Outbound half of a live connection; the writer task drains the receiver.
pub type Outbound = mpsc::UnboundedSender<String>;

/// A live connection owned by one identity.
#[derive(Debug, Clone)]
pub struct Connection {
  identity: Identity,
  tx: Outbound,
}

impl Connection {
  pub fn new(identity: impl Into<Identity>, tx: Outbound) -> Self {
    Self {
      identity: identity.into(),
      tx,
    }
  }

  pub fn identity(&self) -> &str {
    &self.identity
  }

  /// Whether both handles feed the same transport.
  pub fn same_channel(&self, other: &Connection) -> bool {
    self.tx.same_channel(&other.tx)
  }

  /// Whether the writer side is still draining messages.
  pub fn is_open(&self) -> bool {
    !self.tx.is_closed()
  }

  /// Deliver `msg` to this connection only, regardless of room membership.
  pub fn send(&self, msg: &ServerMessage) -> bool {
    encode(msg).is_some_and(|text| self.deliver(&text))
  }

  fn deliver(&self, text: &str) -> bool {
    self.is_open() && self.tx.send(text.to_string()).is_ok()
  }
}

#[derive(Default)]
struct Rooms {
  members: HashMap<MatchId, HashMap<Identity, Connection>>,
  room_of: HashMap<Identity, MatchId>,
}

impl Rooms {
  fn detach(&mut self, identity: &str) -> Option<MatchId> {
    let room_id = self.room_of.remove(identity)?;
    if let Some(members) = self.members.get_mut(&room_id) {
      members.remove(identity);
      if members.is_empty() {
        self.members.remove(&room_id);
      }
    }
    Some(room_id)
  }
}

/// Tracks which connections are interested in which room.
///
/// An identity belongs to at most one room at a time. Rooms are created on
/// first join and dropped as soon as their last member leaves. Cloning is
/// cheap and shares the underlying map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
  rooms: Arc<RwLock<Rooms>>,
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add `connection` to `room_id`, leaving whatever room its identity was in.
  pub async fn join(&self, connection: Connection, room_id: &str) {
    let mut rooms = self.rooms.write().await;
    let identity = connection.identity.clone();

    if let Some(previous) = rooms.detach(&identity) {
      if previous != room_id {
        tracing::debug!("{} moved from room {} to {}", identity, previous, room_id);
      }
    }

    rooms
      .members
      .entry(room_id.to_string())
      .or_default()
      .insert(identity.clone(), connection);
    rooms.room_of.insert(identity, room_id.to_string());
  }

  /// Remove `identity` from its room. Returns the room it was in.
  pub async fn leave(&self, identity: &str) -> Option<MatchId> {
    let left = self.rooms.write().await.detach(identity);
    if left.is_none() {
      tracing::debug!("{} was not in any room", identity);
    }
    left
  }

  /// Remove `connection` from its room, but only if it is still the one
  /// registered for its identity. A newer connection for the same identity
  /// is left in place.
  pub async fn leave_connection(&self, connection: &Connection) -> Option<MatchId> {
    let mut rooms = self.rooms.write().await;
    let identity = connection.identity();
    let current = rooms
      .room_of
      .get(identity)
      .and_then(|room_id| rooms.members.get(room_id))
      .and_then(|members| members.get(identity))
      .is_some_and(|registered| registered.same_channel(connection));
    if !current {
      tracing::debug!("Stale connection of {} left no room", identity);
      return None;
    }
    rooms.detach(identity)
  }

  /// Drop a room entirely, detaching every member from it.
  pub async fn close_room(&self, room_id: &str) {
    let mut rooms = self.rooms.write().await;
    if let Some(members) = rooms.members.remove(room_id) {
      for identity in members.keys() {
        rooms.room_of.remove(identity);
      }
    }
  }

  /// Deliver `msg` to every open connection in `room_id`.
  ///
  /// Returns how many connections it was written to.
  pub async fn broadcast(&self, room_id: &str, msg: &ServerMessage) -> usize {
    let Some(text) = encode(msg) else { return 0 };

    let rooms = self.rooms.read().await;
    let Some(members) = rooms.members.get(room_id) else {
      tracing::debug!("No members in room {} to broadcast to", room_id);
      return 0;
    };

    members.values().filter(|conn| conn.deliver(&text)).count()
  }

  /// Deliver `msg` to the connection `identity` has in its current room.
  pub async fn send_to_identity(&self, identity: &str, msg: &ServerMessage) -> bool {
    let Some(text) = encode(msg) else { return false };

    let rooms = self.rooms.read().await;
    let delivered = rooms
      .room_of
      .get(identity)
      .and_then(|room_id| rooms.members.get(room_id))
      .and_then(|members| members.get(identity))
      .is_some_and(|conn| conn.deliver(&text));

    if !delivered {
      tracing::debug!("Could not deliver to {}: not in a room or connection closed", identity);
    }
    delivered
  }

  /// Deliver `msg` to every connection in every room.
  pub async fn broadcast_to_all(&self, msg: &ServerMessage) -> usize {
    let Some(text) = encode(msg) else { return 0 };

    let rooms = self.rooms.read().await;
    rooms
      .members
      .values()
      .flat_map(|members| members.values())
      .filter(|conn| conn.deliver(&text))
      .count()
  }

  pub async fn room_of(&self, identity: &str) -> Option<MatchId> {
    self.rooms.read().await.room_of.get(identity).cloned()
  }

  pub async fn members(&self, room_id: &str) -> Vec<Identity> {
    self
      .rooms
      .read()
      .await
      .members
      .get(room_id)
      .map(|members| members.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub async fn room_count(&self) -> usize {
    self.rooms.read().await.members.len()
  }
}

fn encode(msg: &ServerMessage) -> Option<String> {
  match msg.to_json() {
    Ok(text) => Some(text),
    Err(e) => {
      tracing::error!("Failed to serialize outbound message: {}", e);
      None
    }
  }
}
