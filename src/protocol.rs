//! Wire protocol shared by clients and the match coordinator.
//!
//! Every frame is a JSON text message of the form
//! `{"type": "<KIND>", "payload": {...}}`. Payload-less kinds omit `payload`.
//!
//! ```
//! use rookery::protocol::ClientMessage;
//!
//! let msg: ClientMessage = serde_json::from_str(
//!   r#"{"type":"MOVE","payload":{"gameId":"g1","move":{"from":"e2","to":"e4"}}}"#,
//! ).unwrap();
//! assert!(matches!(msg, ClientMessage::Move { .. }));
//! ```

use crate::{rating::RatingChanges, store::MoveRecord};
use serde::{Deserialize, Serialize};

/// Opaque user identity as issued by the external identity provider.
pub type Identity = String;

/// Match (and room) identifier; stable across reconnects.
pub type MatchId = String;

/// Seat in a match. White is always the first player and moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
  White,
  Black,
}

impl Side {
  pub fn opponent(self) -> Side {
    match self {
      Side::White => Side::Black,
      Side::Black => Side::White,
    }
  }
}

/// Persisted status of a match. Everything but `InProgress` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
  InProgress,
  Completed,
  Abandoned,
  TimeUp,
  PlayerExit,
}

impl MatchStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, MatchStatus::InProgress)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchResult {
  WhiteWins,
  BlackWins,
  Draw,
}

impl MatchResult {
  /// A decisive result in favour of `side`.
  pub fn win_for(side: Side) -> Self {
    match side {
      Side::White => MatchResult::WhiteWins,
      Side::Black => MatchResult::BlackWins,
    }
  }
}

/// A move as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
  pub from: String,
  pub to: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub promotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
  pub id: Identity,
}

impl PlayerRef {
  pub fn new(id: impl Into<Identity>) -> Self {
    Self { id: id.into() }
  }
}

/// Messages accepted from a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
  tag = "type",
  content = "payload",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
  /// Request to be paired with the next available opponent.
  InitGame,
  Move {
    game_id: MatchId,
    #[serde(rename = "move")]
    mv: MoveRequest,
  },
  JoinRoom {
    game_id: MatchId,
  },
  ExitGame {
    game_id: MatchId,
  },
  ChatSend {
    game_id: MatchId,
    text: String,
  },
}

/// Messages pushed to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
  tag = "type",
  content = "payload",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
  /// A pending pairing slot was created; the requester waits for an opponent.
  GameAdded { game_id: MatchId },
  /// Match start.
  InitGame {
    game_id: MatchId,
    white_player: PlayerRef,
    black_player: PlayerRef,
    fen: String,
    moves: Vec<MoveRecord>,
  },
  Move {
    #[serde(rename = "move")]
    mv: MoveRecord,
    player1_time_consumed: u64,
    player2_time_consumed: u64,
  },
  GameJoined {
    game_id: MatchId,
    moves: Vec<MoveRecord>,
    white_player: PlayerRef,
    black_player: PlayerRef,
    player1_time_consumed: u64,
    player2_time_consumed: u64,
  },
  GameNotFound,
  GameAlert { message: String },
  GameEnded {
    result: MatchResult,
    status: MatchStatus,
    moves: Vec<MoveRecord>,
    white_player: PlayerRef,
    black_player: PlayerRef,
    rating_changes: Option<RatingChanges>,
  },
  ChatMessage {
    game_id: MatchId,
    text: String,
    ts: i64,
    from_user_id: Identity,
  },
  RatingUpdate {
    new_rating: i32,
    rating_change: i32,
    game_id: MatchId,
  },
  LeaderboardUpdate { game_completed: bool, game_id: MatchId },
}

impl ServerMessage {
  pub fn alert(message: impl Into<String>) -> Self {
    ServerMessage::GameAlert {
      message: message.into(),
    }
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}
