//! Boundary to the external rules engine.
//!
//! The match core never inspects a position itself. It asks a [`RulesEngine`]
//! whether a move is legal, applies it, and queries terminal conditions. The
//! position type is opaque to everything but the engine.

use crate::{
  error::RulesError,
  protocol::{MatchResult, Side},
};

mod chess;

pub use chess::{ChessPosition, ChessRules};

pub trait RulesEngine: Send + Sync + 'static {
  type Position: Clone + Send + Sync + 'static;

  /// Starting position of a new match.
  fn initial_position(&self) -> Self::Position;

  /// Serialized snapshot used in broadcasts and move records.
  fn snapshot(&self, position: &Self::Position) -> String;

  fn is_legal_move(&self, position: &Self::Position, from: &str, to: &str) -> bool;

  /// Validate and apply a move, returning the resulting position.
  fn apply_move(
    &self,
    position: &Self::Position,
    from: &str,
    to: &str,
    promotion: Option<&str>,
  ) -> Result<Self::Position, RulesError>;

  fn is_game_over(&self, position: &Self::Position) -> bool;

  fn is_draw(&self, position: &Self::Position) -> bool;

  fn side_to_move(&self, position: &Self::Position) -> Side;

  /// Final result if the game is over: a draw, or a win for the side that
  /// is not left without a move.
  fn result(&self, position: &Self::Position) -> Option<MatchResult> {
    if !self.is_game_over(position) {
      return None;
    }
    if self.is_draw(position) {
      Some(MatchResult::Draw)
    } else {
      Some(MatchResult::win_for(self.side_to_move(position).opponent()))
    }
  }
}
