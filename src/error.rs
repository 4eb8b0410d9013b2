use thiserror::Error;

/// Failures reported by a [`MatchStore`](crate::store::MatchStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Match '{0}' not found")]
  MatchNotFound(String),

  #[error("Match '{0}' already exists")]
  Conflict(String),

  #[error("Store unavailable: {0}")]
  Unavailable(String),
}

/// Failures reported by a [`RulesEngine`](crate::rules::RulesEngine).
#[derive(Debug, Error)]
pub enum RulesError {
  #[error("Invalid square '{0}'")]
  InvalidSquare(String),

  #[error("Illegal move {from}-{to}")]
  IllegalMove { from: String, to: String },
}

/// Reasons a session operation was refused or failed.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("{0} is not a participant of this match")]
  NotParticipant(String),

  #[error("It is not {0}'s turn")]
  OutOfTurn(String),

  #[error("Match already finished")]
  AlreadyFinished,

  #[error("Match has not started")]
  NotStarted,

  #[error("Match is not waiting for an opponent")]
  AlreadyPaired,

  #[error("Cannot pair {0} with themselves")]
  SelfPairing(String),

  #[error(transparent)]
  Rules(#[from] RulesError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Invalid value for {var}: '{value}'")]
  Invalid { var: &'static str, value: String },
}
