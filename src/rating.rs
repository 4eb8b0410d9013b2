//! Elo-style rating computation and per-player rating records.
//!
//! The calculation itself is pure; [`settle`] is the post-match pipeline that
//! reads both players' records from a [`MatchStore`], computes new ratings and
//! writes them back.
//!
//! ## Example
//! ```
//! use rookery::protocol::MatchResult;
//! use rookery::rating::compute_updated_ratings;
//!
//! let (white, black) = compute_updated_ratings(1200, 1200, MatchResult::WhiteWins, 32);
//! assert_eq!((white, black), (1216, 1184));
//! ```

use crate::{
  error::StoreError,
  protocol::{Identity, MatchResult, Side},
  store::MatchStore,
};
use serde::{Deserialize, Serialize};

/// k-factor used when a single fixed value applies to both sides.
pub const DEFAULT_K_FACTOR: i32 = 32;

/// Rating assigned to a player with no record yet.
pub const DEFAULT_BASELINE_RATING: i32 = 1200;

/// Result of a match from one player's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Win,
  Loss,
  Draw,
}

impl Outcome {
  /// The outcome of `result` for the player seated at `side`.
  pub fn for_side(result: MatchResult, side: Side) -> Self {
    match (result, side) {
      (MatchResult::Draw, _) => Outcome::Draw,
      (MatchResult::WhiteWins, Side::White) | (MatchResult::BlackWins, Side::Black) => Outcome::Win,
      _ => Outcome::Loss,
    }
  }

  pub fn score(self) -> f64 {
    match self {
      Outcome::Win => 1.0,
      Outcome::Loss => 0.0,
      Outcome::Draw => 0.5,
    }
  }
}

/// How k is chosen for each player when settling a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KFactorPolicy {
  /// Same k for both sides; deltas are exact negatives of each other.
  Fixed(i32),
  /// Per-player k from [`k_factor`].
  Adaptive,
}

impl Default for KFactorPolicy {
  fn default() -> Self {
    KFactorPolicy::Fixed(DEFAULT_K_FACTOR)
  }
}

impl KFactorPolicy {
  pub fn k_for(self, record: &RatingRecord) -> i32 {
    match self {
      KFactorPolicy::Fixed(k) => k,
      KFactorPolicy::Adaptive => k_factor(record.current_rating, record.games_played),
    }
  }
}

/// k-factor for a player: provisional players move fastest, masters slowest.
pub fn k_factor(rating: i32, games_played: u32) -> i32 {
  if games_played < 30 {
    40
  } else if rating < 2100 {
    20
  } else {
    10
  }
}

/// Expected score of a player rated `rating` against `opponent`.
pub fn expected_score(rating: i32, opponent: i32) -> f64 {
  1.0 / (1.0 + 10f64.powf(f64::from(opponent - rating) / 400.0))
}

/// New `(white, black)` ratings for `result` with one k for both sides.
pub fn compute_updated_ratings(
  white: i32,
  black: i32,
  result: MatchResult,
  k_factor: i32,
) -> (i32, i32) {
  compute_updated_ratings_with(white, black, result, k_factor, k_factor)
}

/// New `(white, black)` ratings with an independent k per side.
pub fn compute_updated_ratings_with(
  white: i32,
  black: i32,
  result: MatchResult,
  white_k: i32,
  black_k: i32,
) -> (i32, i32) {
  let expected_white = expected_score(white, black);
  let expected_black = 1.0 - expected_white;

  let actual_white = Outcome::for_side(result, Side::White).score();
  let actual_black = Outcome::for_side(result, Side::Black).score();

  let new_white = (f64::from(white) + f64::from(white_k) * (actual_white - expected_white)).round();
  let new_black = (f64::from(black) + f64::from(black_k) * (actual_black - expected_black)).round();

  (new_white as i32, new_black as i32)
}

/// Per-player rating record as kept by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRecord {
  pub player_id: Identity,
  pub current_rating: i32,
  pub peak_rating: i32,
  pub games_played: u32,
  pub wins: u32,
  pub losses: u32,
  pub draws: u32,
  pub win_streak: u32,
  pub longest_win_streak: u32,
}

impl RatingRecord {
  /// A fresh record at `baseline` with zeroed counters.
  pub fn new(player_id: impl Into<Identity>, baseline: i32) -> Self {
    Self {
      player_id: player_id.into(),
      current_rating: baseline,
      peak_rating: baseline,
      games_played: 0,
      wins: 0,
      losses: 0,
      draws: 0,
      win_streak: 0,
      longest_win_streak: 0,
    }
  }

  /// Fold one finished game into the record.
  pub fn record(&mut self, new_rating: i32, outcome: Outcome) {
    self.current_rating = new_rating;
    self.peak_rating = self.peak_rating.max(new_rating);
    self.games_played += 1;
    match outcome {
      Outcome::Win => {
        self.wins += 1;
        self.win_streak += 1;
        self.longest_win_streak = self.longest_win_streak.max(self.win_streak);
      }
      Outcome::Loss => {
        self.losses += 1;
        self.win_streak = 0;
      }
      Outcome::Draw => {
        self.draws += 1;
        self.win_streak = 0;
      }
    }
  }
}

/// Rating deltas attached to the match-ended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingChanges {
  pub white_rating_change: i32,
  pub black_rating_change: i32,
  pub white_new_rating: i32,
  pub black_new_rating: i32,
}

/// Read both ratings, compute the new ones and write them back.
pub async fn settle(
  store: &dyn MatchStore,
  white: &str,
  black: &str,
  result: MatchResult,
  policy: KFactorPolicy,
  baseline: i32,
) -> Result<RatingChanges, StoreError> {
  let white_before = store
    .read_rating(white)
    .await?
    .unwrap_or_else(|| RatingRecord::new(white, baseline));
  let black_before = store
    .read_rating(black)
    .await?
    .unwrap_or_else(|| RatingRecord::new(black, baseline));

  let (white_new, black_new) = compute_updated_ratings_with(
    white_before.current_rating,
    black_before.current_rating,
    result,
    policy.k_for(&white_before),
    policy.k_for(&black_before),
  );

  store
    .upsert_rating(white, white_new, Outcome::for_side(result, Side::White))
    .await?;
  store
    .upsert_rating(black, black_new, Outcome::for_side(result, Side::Black))
    .await?;

  tracing::info!(
    "Ratings settled: {} {} -> {}, {} {} -> {}",
    white,
    white_before.current_rating,
    white_new,
    black,
    black_before.current_rating,
    black_new
  );

  Ok(RatingChanges {
    white_rating_change: white_new - white_before.current_rating,
    black_rating_change: black_new - black_before.current_rating,
    white_new_rating: white_new,
    black_new_rating: black_new,
  })
}
