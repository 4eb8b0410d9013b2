//! Standard chess rules backed by shakmaty.

use super::RulesEngine;
use crate::{error::RulesError, protocol::Side};
use shakmaty::{
  fen::Fen,
  uci::UciMove,
  zobrist::{Zobrist64, ZobristHash},
  Chess, Color, EnPassantMode, Move, Position, Square,
};
use std::collections::HashMap;

/// Orthodox chess. Positions are snapshotted as FEN.
///
/// A pawn reaching the last rank without a promotion hint becomes a queen.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChessRules;

/// A board plus how often each position has occurred in this game.
#[derive(Debug, Clone)]
pub struct ChessPosition {
  board: Chess,
  seen: HashMap<Zobrist64, u8>,
}

impl ChessPosition {
  fn key(board: &Chess) -> Zobrist64 {
    board.zobrist_hash(EnPassantMode::Legal)
  }

  fn advance(&self, board: Chess) -> Self {
    let mut seen = self.seen.clone();
    *seen.entry(Self::key(&board)).or_insert(0) += 1;
    Self { board, seen }
  }

  /// Occurrences of the current position, including this one.
  pub fn repetitions(&self) -> u8 {
    self.seen.get(&Self::key(&self.board)).copied().unwrap_or(0)
  }
}

impl From<Chess> for ChessPosition {
  fn from(board: Chess) -> Self {
    let seen = HashMap::from([(Self::key(&board), 1)]);
    Self { board, seen }
  }
}

impl ChessRules {
  fn find_move(
    &self,
    position: &Chess,
    from: &str,
    to: &str,
    promotion: Option<&str>,
  ) -> Result<Move, RulesError> {
    from
      .parse::<Square>()
      .map_err(|_| RulesError::InvalidSquare(from.to_string()))?;
    to
      .parse::<Square>()
      .map_err(|_| RulesError::InvalidSquare(to.to_string()))?;

    let illegal = || RulesError::IllegalMove {
      from: from.to_string(),
      to: to.to_string(),
    };

    let promotion = match promotion {
      Some(p) => {
        let p = p.to_ascii_lowercase();
        if !matches!(p.as_str(), "q" | "r" | "b" | "n") {
          return Err(illegal());
        }
        p
      }
      None => String::new(),
    };

    let to_move = |uci: String| -> Option<Move> {
      uci
        .parse::<UciMove>()
        .ok()
        .and_then(|m| m.to_move(position).ok())
    };

    to_move(format!("{}{}{}", from, to, promotion))
      .or_else(|| {
        if promotion.is_empty() {
          to_move(format!("{}{}q", from, to))
        } else {
          None
        }
      })
      .ok_or_else(illegal)
  }
}

impl RulesEngine for ChessRules {
  type Position = ChessPosition;

  fn initial_position(&self) -> ChessPosition {
    Chess::default().into()
  }

  fn snapshot(&self, position: &ChessPosition) -> String {
    Fen::from_position(position.board.clone(), EnPassantMode::Legal).to_string()
  }

  fn is_legal_move(&self, position: &ChessPosition, from: &str, to: &str) -> bool {
    self.find_move(&position.board, from, to, None).is_ok()
  }

  fn apply_move(
    &self,
    position: &ChessPosition,
    from: &str,
    to: &str,
    promotion: Option<&str>,
  ) -> Result<ChessPosition, RulesError> {
    let m = self.find_move(&position.board, from, to, promotion)?;
    let board = position
      .board
      .clone()
      .play(&m)
      .map_err(|_| RulesError::IllegalMove {
        from: from.to_string(),
        to: to.to_string(),
      })?;
    Ok(position.advance(board))
  }

  fn is_game_over(&self, position: &ChessPosition) -> bool {
    position.board.is_checkmate() || self.is_draw(position)
  }

  /// Stalemate, dead position, the fifty-move rule, or threefold repetition.
  fn is_draw(&self, position: &ChessPosition) -> bool {
    let board = &position.board;
    board.is_stalemate()
      || board.is_insufficient_material()
      || board.halfmoves() >= 100
      || position.repetitions() >= 3
  }

  fn side_to_move(&self, position: &ChessPosition) -> Side {
    match position.board.turn() {
      Color::White => Side::White,
      Color::Black => Side::Black,
    }
  }
}
