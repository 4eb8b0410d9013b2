//! Test doubles shared by the unit tests.

use crate::{
  error::{RulesError, StoreError},
  protocol::{MatchResult, MatchStatus, MoveRequest, ServerMessage, Side},
  rating::{Outcome, RatingRecord},
  rules::RulesEngine,
  store::{InMemoryStore, MatchRecord, MatchStore, MoveRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};
use tokio::sync::mpsc;

/// Rules where any move with `from != to` is legal. Moving to `mate` wins for
/// the mover and moving to `draw` ends the game drawn.
pub struct ScriptRules;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptPosition {
  ply: u32,
  ended: Option<&'static str>,
}

impl RulesEngine for ScriptRules {
  type Position = ScriptPosition;

  fn initial_position(&self) -> ScriptPosition {
    ScriptPosition::default()
  }

  fn snapshot(&self, position: &ScriptPosition) -> String {
    match position.ended {
      Some(how) => format!("ply {} {}", position.ply, how),
      None => format!("ply {}", position.ply),
    }
  }

  fn is_legal_move(&self, position: &ScriptPosition, from: &str, to: &str) -> bool {
    position.ended.is_none() && from != to
  }

  fn apply_move(
    &self,
    position: &ScriptPosition,
    from: &str,
    to: &str,
    _promotion: Option<&str>,
  ) -> Result<ScriptPosition, RulesError> {
    if !self.is_legal_move(position, from, to) {
      return Err(RulesError::IllegalMove {
        from: from.to_string(),
        to: to.to_string(),
      });
    }
    Ok(ScriptPosition {
      ply: position.ply + 1,
      ended: match to {
        "mate" => Some("mate"),
        "draw" => Some("draw"),
        _ => None,
      },
    })
  }

  fn is_game_over(&self, position: &ScriptPosition) -> bool {
    position.ended.is_some()
  }

  fn is_draw(&self, position: &ScriptPosition) -> bool {
    position.ended == Some("draw")
  }

  fn side_to_move(&self, position: &ScriptPosition) -> Side {
    if position.ply % 2 == 0 {
      Side::White
    } else {
      Side::Black
    }
  }
}

/// [`InMemoryStore`] with switchable write failures.
#[derive(Clone, Default)]
pub struct FlakyStore {
  pub inner: InMemoryStore,
  moves_fail: Arc<AtomicBool>,
  status_fails: Arc<AtomicBool>,
  ratings_fail: Arc<AtomicBool>,
}

impl FlakyStore {
  pub fn fail_moves(&self, on: bool) {
    self.moves_fail.store(on, Ordering::SeqCst);
  }

  pub fn fail_status(&self, on: bool) {
    self.status_fails.store(on, Ordering::SeqCst);
  }

  pub fn fail_ratings(&self, on: bool) {
    self.ratings_fail.store(on, Ordering::SeqCst);
  }

  fn check(flag: &AtomicBool) -> Result<(), StoreError> {
    if flag.load(Ordering::SeqCst) {
      Err(StoreError::Unavailable("injected failure".into()))
    } else {
      Ok(())
    }
  }
}

#[async_trait]
impl MatchStore for FlakyStore {
  async fn create_match(
    &self,
    id: &str,
    white: &str,
    black: &str,
    initial_position: &str,
    start_at: DateTime<Utc>,
  ) -> Result<MatchRecord, StoreError> {
    self
      .inner
      .create_match(id, white, black, initial_position, start_at)
      .await
  }

  async fn append_move(&self, match_id: &str, record: &MoveRecord) -> Result<(), StoreError> {
    Self::check(&self.moves_fail)?;
    self.inner.append_move(match_id, record).await
  }

  async fn update_match_status(
    &self,
    match_id: &str,
    status: MatchStatus,
    result: MatchResult,
  ) -> Result<MatchRecord, StoreError> {
    Self::check(&self.status_fails)?;
    self.inner.update_match_status(match_id, status, result).await
  }

  async fn read_match(&self, match_id: &str) -> Result<Option<MatchRecord>, StoreError> {
    self.inner.read_match(match_id).await
  }

  async fn read_rating(&self, player_id: &str) -> Result<Option<RatingRecord>, StoreError> {
    Self::check(&self.ratings_fail)?;
    self.inner.read_rating(player_id).await
  }

  async fn upsert_rating(
    &self,
    player_id: &str,
    new_rating: i32,
    outcome: Outcome,
  ) -> Result<RatingRecord, StoreError> {
    Self::check(&self.ratings_fail)?;
    self.inner.upsert_rating(player_id, new_rating, outcome).await
  }
}

pub fn mv(from: &str, to: &str) -> MoveRequest {
  MoveRequest {
    from: from.to_string(),
    to: to.to_string(),
    promotion: None,
  }
}

/// Everything queued on `rx` so far, decoded.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
  let mut out = Vec::new();
  while let Ok(text) = rx.try_recv() {
    out.push(serde_json::from_str(&text).expect("server sent invalid json"));
  }
  out
}
