//! In-memory store backed by hash maps behind a single mutex.

use super::{MatchRecord, MatchStore, MoveRecord};
use crate::{
  error::StoreError,
  protocol::{MatchResult, MatchStatus},
  rating::{Outcome, RatingRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

#[derive(Default)]
struct Tables {
  matches: HashMap<String, MatchRecord>,
  ratings: HashMap<String, RatingRecord>,
}

/// Single-process store. Nothing survives a restart.
///
/// Each trait operation takes the lock once, so every write is atomic with
/// respect to the others.
#[derive(Clone)]
pub struct InMemoryStore {
  tables: Arc<Mutex<Tables>>,
  baseline_rating: i32,
}

impl InMemoryStore {
  /// Create an empty store whose new rating records start at `baseline_rating`.
  pub fn new(baseline_rating: i32) -> Self {
    Self {
      tables: Arc::new(Mutex::new(Tables::default())),
      baseline_rating,
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
    self.tables.lock().expect("InMemoryStore lock poisoned")
  }
}

impl Default for InMemoryStore {
  fn default() -> Self {
    Self::new(crate::rating::DEFAULT_BASELINE_RATING)
  }
}

#[async_trait]
impl MatchStore for InMemoryStore {
  async fn create_match(
    &self,
    id: &str,
    white: &str,
    black: &str,
    initial_position: &str,
    start_at: DateTime<Utc>,
  ) -> Result<MatchRecord, StoreError> {
    let mut tables = self.lock();
    if tables.matches.contains_key(id) {
      return Err(StoreError::Conflict(id.to_string()));
    }

    let record = MatchRecord {
      id: id.to_string(),
      white_player_id: white.to_string(),
      black_player_id: black.to_string(),
      status: MatchStatus::InProgress,
      result: None,
      initial_position: initial_position.to_string(),
      current_position: initial_position.to_string(),
      start_at,
      end_at: None,
      moves: Vec::new(),
    };
    tables.matches.insert(id.to_string(), record.clone());
    Ok(record)
  }

  async fn append_move(&self, match_id: &str, record: &MoveRecord) -> Result<(), StoreError> {
    let mut tables = self.lock();
    let game = tables
      .matches
      .get_mut(match_id)
      .ok_or_else(|| StoreError::MatchNotFound(match_id.to_string()))?;

    let expected = game.moves.len() as u32 + 1;
    if record.move_number != expected {
      return Err(StoreError::Conflict(format!(
        "{} move {} (expected {})",
        match_id, record.move_number, expected
      )));
    }

    game.current_position = record.after.clone();
    game.moves.push(record.clone());
    Ok(())
  }

  async fn update_match_status(
    &self,
    match_id: &str,
    status: MatchStatus,
    result: MatchResult,
  ) -> Result<MatchRecord, StoreError> {
    let mut tables = self.lock();
    let game = tables
      .matches
      .get_mut(match_id)
      .ok_or_else(|| StoreError::MatchNotFound(match_id.to_string()))?;

    game.status = status;
    game.result = Some(result);
    game.end_at = Some(Utc::now());
    Ok(game.clone())
  }

  async fn read_match(&self, match_id: &str) -> Result<Option<MatchRecord>, StoreError> {
    Ok(self.lock().matches.get(match_id).cloned())
  }

  async fn read_rating(&self, player_id: &str) -> Result<Option<RatingRecord>, StoreError> {
    Ok(self.lock().ratings.get(player_id).cloned())
  }

  async fn upsert_rating(
    &self,
    player_id: &str,
    new_rating: i32,
    outcome: Outcome,
  ) -> Result<RatingRecord, StoreError> {
    let baseline = self.baseline_rating;
    let mut tables = self.lock();
    let record = tables
      .ratings
      .entry(player_id.to_string())
      .or_insert_with(|| RatingRecord::new(player_id, baseline));
    record.record(new_rating, outcome);
    Ok(record.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mv(n: u32, from: &str, to: &str) -> MoveRecord {
    MoveRecord {
      move_number: n,
      from: from.into(),
      to: to.into(),
      promotion: None,
      after: format!("pos-{}", n),
      created_at: Utc::now(),
      time_taken: 100,
    }
  }

  #[tokio::test]
  async fn create_append_and_finish() {
    let store = InMemoryStore::default();
    store
      .create_match("g1", "w", "b", "start", Utc::now())
      .await
      .unwrap();
    store.append_move("g1", &mv(1, "e2", "e4")).await.unwrap();
    store.append_move("g1", &mv(2, "e7", "e5")).await.unwrap();

    let finished = store
      .update_match_status("g1", MatchStatus::PlayerExit, MatchResult::BlackWins)
      .await
      .unwrap();
    assert_eq!(finished.moves.len(), 2);
    assert_eq!(finished.current_position, "pos-2");
    assert_eq!(finished.status, MatchStatus::PlayerExit);
    assert!(finished.end_at.is_some());
  }

  #[tokio::test]
  async fn duplicate_match_is_a_conflict() {
    let store = InMemoryStore::default();
    store
      .create_match("g1", "w", "b", "start", Utc::now())
      .await
      .unwrap();
    let err = store
      .create_match("g1", "w", "b", "start", Utc::now())
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
  }

  #[tokio::test]
  async fn out_of_order_move_is_rejected() {
    let store = InMemoryStore::default();
    store
      .create_match("g1", "w", "b", "start", Utc::now())
      .await
      .unwrap();
    assert!(store.append_move("g1", &mv(2, "e2", "e4")).await.is_err());
    assert!(store.append_move("nope", &mv(1, "e2", "e4")).await.is_err());
  }

  #[tokio::test]
  async fn unknown_match_reads_as_none() {
    let store = InMemoryStore::default();
    assert!(store.read_match("missing").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn upsert_starts_from_baseline() {
    let store = InMemoryStore::new(1500);
    let record = store.upsert_rating("p", 1490, Outcome::Loss).await.unwrap();
    assert_eq!(record.current_rating, 1490);
    assert_eq!(record.peak_rating, 1500);
    assert_eq!(record.games_played, 1);
  }
}
