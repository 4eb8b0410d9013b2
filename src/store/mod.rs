//! Persistence contract consumed by the match core.
//!
//! The core never reads-modifies-writes a record itself: every mutation goes
//! through one of the atomic operations below. [`InMemoryStore`] is the
//! in-process implementation used by the server binary and the tests.

use crate::{
  error::StoreError,
  protocol::{Identity, MatchId, MatchResult, MatchStatus},
  rating::{Outcome, RatingRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod memory;

pub use memory::InMemoryStore;

/// One applied move. Immutable once created; stored append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
  /// 1-based ordinal within the match.
  pub move_number: u32,
  pub from: String,
  pub to: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub promotion: Option<String>,
  /// Position snapshot after the move.
  pub after: String,
  pub created_at: DateTime<Utc>,
  /// Milliseconds since the previous move (or match start).
  pub time_taken: u64,
}

/// A persisted match with its ordered move list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
  pub id: MatchId,
  pub white_player_id: Identity,
  pub black_player_id: Identity,
  pub status: MatchStatus,
  pub result: Option<MatchResult>,
  pub initial_position: String,
  pub current_position: String,
  pub start_at: DateTime<Utc>,
  pub end_at: Option<DateTime<Utc>>,
  pub moves: Vec<MoveRecord>,
}

/// Trait implemented by all persistence backends.
#[async_trait]
pub trait MatchStore: Send + Sync {
  /// Persist a new in-progress match.
  ///
  /// ## Returns
  /// - `Err(StoreError::Conflict)` if a match with `id` already exists.
  async fn create_match(
    &self,
    id: &str,
    white: &str,
    black: &str,
    initial_position: &str,
    start_at: DateTime<Utc>,
  ) -> Result<MatchRecord, StoreError>;

  /// Append a move and advance the match's current position.
  async fn append_move(&self, match_id: &str, record: &MoveRecord) -> Result<(), StoreError>;

  /// Set the terminal status and result, returning the updated match with
  /// its ordered move list.
  async fn update_match_status(
    &self,
    match_id: &str,
    status: MatchStatus,
    result: MatchResult,
  ) -> Result<MatchRecord, StoreError>;

  /// `Ok(None)` when no such match was ever persisted.
  async fn read_match(&self, match_id: &str) -> Result<Option<MatchRecord>, StoreError>;

  async fn read_rating(&self, player_id: &str) -> Result<Option<RatingRecord>, StoreError>;

  /// Fold a finished game into the player's rating record, creating a
  /// baseline record first if none exists.
  async fn upsert_rating(
    &self,
    player_id: &str,
    new_rating: i32,
    outcome: Outcome,
  ) -> Result<RatingRecord, StoreError>;
}
