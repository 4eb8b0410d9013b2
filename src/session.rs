//! One match: seats, position, clocks and the path to a terminal result.
//!
//! All mutations of a session go through its state mutex, so moves, exits
//! and timer expiries for the same match are applied one at a time. The two
//! timers (abandonment watchdog and move clock) are spawned tasks owned by the
//! session. Re-arming or terminating always cancels the previous instances, and
//! each task carries the generation it was armed in so that a late wake-up from
//! a superseded timer is ignored.

use crate::{
  config::MatchSettings,
  error::SessionError,
  protocol::{
    Identity, MatchId, MatchResult, MatchStatus, MoveRequest, PlayerRef, ServerMessage, Side,
  },
  rating,
  registry::ConnectionRegistry,
  rules::RulesEngine,
  store::{MatchRecord, MatchStore, MoveRecord},
};
use chrono::{DateTime, Utc};
use std::{
  collections::HashMap,
  sync::{Arc, Weak},
  time::Duration,
};
use tokio::{
  sync::{Mutex, RwLock},
  task::JoinHandle,
  time::Instant,
};

/// Live sessions keyed by match id.
pub(crate) type SessionMap<R> = RwLock<HashMap<MatchId, Arc<MatchSession<R>>>>;

/// Collaborators shared by every session of a coordinator.
pub struct SessionContext<R: RulesEngine> {
  pub rules: Arc<R>,
  pub store: Arc<dyn MatchStore>,
  pub registry: ConnectionRegistry,
  pub settings: MatchSettings,
  sessions: Weak<SessionMap<R>>,
}

impl<R: RulesEngine> SessionContext<R> {
  pub(crate) fn new(
    rules: Arc<R>,
    store: Arc<dyn MatchStore>,
    registry: ConnectionRegistry,
    settings: MatchSettings,
    sessions: &Arc<SessionMap<R>>,
  ) -> Self {
    Self {
      rules,
      store,
      registry,
      settings,
      sessions: Arc::downgrade(sessions),
    }
  }

  /// Forget a finished session and its room.
  pub(crate) async fn evict(&self, match_id: &str) {
    if let Some(sessions) = self.sessions.upgrade() {
      sessions.write().await.remove(match_id);
    }
    self.registry.close_room(match_id).await;
    tracing::debug!("Evicted match {}", match_id);
  }
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
  PendingOpponent,
  InProgress,
  Finished(MatchStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seats {
  Unpaired { first: Identity },
  Paired { white: Identity, black: Identity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Finish {
  status: MatchStatus,
  result: MatchResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
  Abandon,
  Clock,
}

#[derive(Default)]
struct Timers {
  abandon: Option<JoinHandle<()>>,
  clock: Option<JoinHandle<()>>,
  generation: u64,
}

impl Timers {
  fn cancel(&mut self) {
    for handle in [self.abandon.take(), self.clock.take()].into_iter().flatten() {
      handle.abort();
    }
    self.generation += 1;
  }

  /// Detach the handle of a timer that is currently running its expiry, so
  /// that a later `cancel` does not abort the task mid-termination.
  fn release(&mut self, kind: TimerKind) {
    match kind {
      TimerKind::Abandon => self.abandon = None,
      TimerKind::Clock => self.clock = None,
    }
  }
}

struct SessionState<P> {
  seats: Seats,
  position: P,
  moves: Vec<MoveRecord>,
  white_ms: u64,
  black_ms: u64,
  started_at: DateTime<Utc>,
  last_move_at: Instant,
  finish: Option<Finish>,
  timers: Timers,
}

impl<P> SessionState<P> {
  fn players(&self) -> Option<(&str, &str)> {
    match &self.seats {
      Seats::Paired { white, black } => Some((white, black)),
      Seats::Unpaired { .. } => None,
    }
  }

  fn side_of(&self, identity: &str) -> Option<Side> {
    let (white, black) = self.players()?;
    if identity == white {
      Some(Side::White)
    } else if identity == black {
      Some(Side::Black)
    } else {
      None
    }
  }

  fn consumed_ms(&self, side: Side) -> u64 {
    match side {
      Side::White => self.white_ms,
      Side::Black => self.black_ms,
    }
  }
}

/// A move that was validated, persisted and broadcast.
#[derive(Debug, Clone)]
pub struct AppliedMove {
  pub record: MoveRecord,
  /// Set when this move ended the match.
  pub finished: Option<(MatchStatus, MatchResult)>,
}

/// Point-in-time view of a session for replies and tests.
#[derive(Debug, Clone)]
pub struct SessionView {
  pub id: MatchId,
  pub phase: SessionPhase,
  pub white: Identity,
  pub black: Option<Identity>,
  pub result: Option<MatchResult>,
  pub position: String,
  pub moves: Vec<MoveRecord>,
  pub started_at: DateTime<Utc>,
  /// Committed time consumed, in milliseconds.
  pub white_time_consumed: u64,
  pub black_time_consumed: u64,
}

pub struct MatchSession<R: RulesEngine> {
  id: MatchId,
  ctx: Arc<SessionContext<R>>,
  state: Mutex<SessionState<R::Position>>,
}

impl<R: RulesEngine> MatchSession<R> {
  /// A session waiting for its second player.
  pub fn pending(ctx: Arc<SessionContext<R>>, id: MatchId, first: Identity) -> Arc<Self> {
    let position = ctx.rules.initial_position();
    Arc::new(Self {
      id,
      state: Mutex::new(SessionState {
        seats: Seats::Unpaired { first },
        position,
        moves: Vec::new(),
        white_ms: 0,
        black_ms: 0,
        started_at: Utc::now(),
        last_move_at: Instant::now(),
        finish: None,
        timers: Timers::default(),
      }),
      ctx,
    })
  }

  /// Rebuild an in-progress session by replaying its persisted moves.
  pub async fn rehydrate(
    ctx: Arc<SessionContext<R>>,
    record: &MatchRecord,
  ) -> Result<Arc<Self>, SessionError> {
    let rules = &ctx.rules;
    let mut position = rules.initial_position();
    let (mut white_ms, mut black_ms) = (0, 0);

    for mv in &record.moves {
      let mover = rules.side_to_move(&position);
      position = rules.apply_move(&position, &mv.from, &mv.to, mv.promotion.as_deref())?;
      match mover {
        Side::White => white_ms += mv.time_taken,
        Side::Black => black_ms += mv.time_taken,
      }
    }

    let last_wall = record
      .moves
      .last()
      .map_or(record.start_at, |mv| mv.created_at);
    let since_last = (Utc::now() - last_wall).to_std().unwrap_or_default();
    let now = Instant::now();

    let session = Arc::new(Self {
      id: record.id.clone(),
      state: Mutex::new(SessionState {
        seats: Seats::Paired {
          white: record.white_player_id.clone(),
          black: record.black_player_id.clone(),
        },
        position,
        moves: record.moves.clone(),
        white_ms,
        black_ms,
        started_at: record.start_at,
        last_move_at: now.checked_sub(since_last).unwrap_or(now),
        finish: None,
        timers: Timers::default(),
      }),
      ctx,
    });

    {
      let mut state = session.state.lock().await;
      session.arm_timers(&mut state);
    }

    tracing::info!(
      "Rehydrated match {} with {} moves",
      record.id,
      record.moves.len()
    );
    Ok(session)
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Seat the second player, persist the match and announce the start.
  pub async fn start(self: &Arc<Self>, second: &str) -> Result<(), SessionError> {
    let mut state = self.state.lock().await;
    let first = match &state.seats {
      Seats::Paired { .. } => return Err(SessionError::AlreadyPaired),
      Seats::Unpaired { first } if first == second => {
        return Err(SessionError::SelfPairing(second.to_string()))
      }
      Seats::Unpaired { first } => first.clone(),
    };

    let fen = self.ctx.rules.snapshot(&state.position);
    let started_at = Utc::now();
    self
      .ctx
      .store
      .create_match(&self.id, &first, second, &fen, started_at)
      .await
      .inspect_err(|e| tracing::error!("Failed to persist match {}: {}", self.id, e))?;

    state.seats = Seats::Paired {
      white: first.clone(),
      black: second.to_string(),
    };
    state.started_at = started_at;
    state.last_move_at = Instant::now();
    self.arm_timers(&mut state);

    tracing::info!("Match {} started: {} vs {}", self.id, first, second);

    self
      .ctx
      .registry
      .broadcast(
        &self.id,
        &ServerMessage::InitGame {
          game_id: self.id.clone(),
          white_player: PlayerRef::new(first),
          black_player: PlayerRef::new(second),
          fen,
          moves: Vec::new(),
        },
      )
      .await;
    Ok(())
  }

  /// Validate, persist and broadcast a move from `identity`.
  ///
  /// Any `Err` leaves the session untouched and nothing is broadcast.
  pub async fn apply_move(
    self: &Arc<Self>,
    identity: &str,
    mv: &MoveRequest,
  ) -> Result<AppliedMove, SessionError> {
    let mut state = self.state.lock().await;
    if state.finish.is_some() {
      return Err(SessionError::AlreadyFinished);
    }
    let Some(mover) = state.side_of(identity) else {
      return match state.seats {
        Seats::Unpaired { .. } => Err(SessionError::NotStarted),
        Seats::Paired { .. } => Err(SessionError::NotParticipant(identity.to_string())),
      };
    };

    let rules = &self.ctx.rules;
    if rules.side_to_move(&state.position) != mover {
      return Err(SessionError::OutOfTurn(identity.to_string()));
    }

    let next = rules.apply_move(&state.position, &mv.from, &mv.to, mv.promotion.as_deref())?;

    let now = Instant::now();
    let taken = now.saturating_duration_since(state.last_move_at).as_millis() as u64;
    let record = MoveRecord {
      move_number: state.moves.len() as u32 + 1,
      from: mv.from.clone(),
      to: mv.to.clone(),
      promotion: mv.promotion.clone(),
      after: rules.snapshot(&next),
      created_at: Utc::now(),
      time_taken: taken,
    };

    self
      .ctx
      .store
      .append_move(&self.id, &record)
      .await
      .inspect_err(|e| tracing::error!("Failed to persist move in {}: {}", self.id, e))?;

    state.position = next;
    match mover {
      Side::White => state.white_ms += taken,
      Side::Black => state.black_ms += taken,
    }
    state.moves.push(record.clone());
    self.arm_timers(&mut state);
    state.last_move_at = now;

    self
      .ctx
      .registry
      .broadcast(
        &self.id,
        &ServerMessage::Move {
          mv: record.clone(),
          player1_time_consumed: state.white_ms,
          player2_time_consumed: state.black_ms,
        },
      )
      .await;

    if let Some(result) = rules.result(&state.position) {
      self
        .terminate_locked(&mut state, MatchStatus::Completed, result)
        .await;
    }

    Ok(AppliedMove {
      record,
      finished: state.finish.map(|f| (f.status, f.result)),
    })
  }

  /// `identity` leaves the match; the other player is credited the win.
  pub async fn exit(&self, identity: &str) -> Result<(), SessionError> {
    let mut state = self.state.lock().await;
    if state.finish.is_some() {
      return Err(SessionError::AlreadyFinished);
    }
    let Some(side) = state.side_of(identity) else {
      return match state.seats {
        Seats::Unpaired { .. } => Err(SessionError::NotStarted),
        Seats::Paired { .. } => Err(SessionError::NotParticipant(identity.to_string())),
      };
    };

    self
      .terminate_locked(
        &mut state,
        MatchStatus::PlayerExit,
        MatchResult::win_for(side.opponent()),
      )
      .await;
    Ok(())
  }

  /// End the match. A second call, or a call on an unpaired session, is a no-op.
  pub async fn terminate(&self, status: MatchStatus, result: MatchResult) {
    let mut state = self.state.lock().await;
    self.terminate_locked(&mut state, status, result).await;
  }

  async fn terminate_locked(
    &self,
    state: &mut SessionState<R::Position>,
    status: MatchStatus,
    result: MatchResult,
  ) {
    if state.finish.is_some() {
      return;
    }
    let Some((white, black)) = state.players().map(|(w, b)| (w.to_string(), b.to_string())) else {
      return;
    };
    state.finish = Some(Finish { status, result });
    tracing::info!("Match {} ended: {:?} {:?}", self.id, status, result);

    let ctx = &self.ctx;
    let record = match ctx.store.update_match_status(&self.id, status, result).await {
      Ok(record) => record,
      Err(e) => {
        tracing::error!("Failed to persist result of match {}: {}", self.id, e);
        state.timers.cancel();
        return;
      }
    };

    let changes = rating::settle(
      ctx.store.as_ref(),
      &white,
      &black,
      result,
      ctx.settings.k_factor,
      ctx.settings.baseline_rating,
    )
    .await
    .inspect_err(|e| tracing::error!("Failed to update ratings for match {}: {}", self.id, e))
    .ok();

    ctx
      .registry
      .broadcast(
        &self.id,
        &ServerMessage::GameEnded {
          result,
          status,
          moves: record.moves,
          white_player: PlayerRef::new(white.clone()),
          black_player: PlayerRef::new(black.clone()),
          rating_changes: changes,
        },
      )
      .await;

    if let Some(changes) = changes {
      for (player, new_rating, delta) in [
        (&white, changes.white_new_rating, changes.white_rating_change),
        (&black, changes.black_new_rating, changes.black_rating_change),
      ] {
        ctx
          .registry
          .send_to_identity(
            player,
            &ServerMessage::RatingUpdate {
              new_rating,
              rating_change: delta,
              game_id: self.id.clone(),
            },
          )
          .await;
      }
    }

    ctx
      .registry
      .broadcast_to_all(&ServerMessage::LeaderboardUpdate {
        game_completed: true,
        game_id: self.id.clone(),
      })
      .await;

    state.timers.cancel();
  }

  /// Restart both timers for the side now on move.
  fn arm_timers(self: &Arc<Self>, state: &mut SessionState<R::Position>) {
    state.timers.cancel();
    let generation = state.timers.generation;

    let on_move = self.ctx.rules.side_to_move(&state.position);
    let remaining = self
      .ctx
      .settings
      .game_time
      .saturating_sub(Duration::from_millis(state.consumed_ms(on_move)));

    state.timers.abandon = Some(self.spawn_timer(
      TimerKind::Abandon,
      self.ctx.settings.abandon_timeout,
      generation,
    ));
    state.timers.clock = Some(self.spawn_timer(TimerKind::Clock, remaining, generation));
  }

  fn spawn_timer(self: &Arc<Self>, kind: TimerKind, after: Duration, generation: u64) -> JoinHandle<()> {
    let session = Arc::downgrade(self);
    tokio::spawn(async move {
      tokio::time::sleep(after).await;
      if let Some(session) = session.upgrade() {
        session.expire(kind, generation).await;
      }
    })
  }

  async fn expire(&self, kind: TimerKind, generation: u64) {
    let finished = {
      let mut state = self.state.lock().await;
      if state.finish.is_some() || state.timers.generation != generation {
        return;
      }
      state.timers.release(kind);

      // Both timers blame the side on move: it failed to respond, or its clock ran out.
      let on_move = self.ctx.rules.side_to_move(&state.position);
      let status = match kind {
        TimerKind::Abandon => MatchStatus::Abandoned,
        TimerKind::Clock => MatchStatus::TimeUp,
      };
      tracing::info!("Match {}: {:?} for {:?}", self.id, status, on_move);
      self
        .terminate_locked(&mut state, status, MatchResult::win_for(on_move.opponent()))
        .await;
      state.finish.is_some()
    };

    if finished {
      self.ctx.evict(&self.id).await;
    }
  }

  /// First player of a session still waiting for an opponent.
  pub async fn pending_owner(&self) -> Option<Identity> {
    match &self.state.lock().await.seats {
      Seats::Unpaired { first } => Some(first.clone()),
      Seats::Paired { .. } => None,
    }
  }

  /// Time consumed per side including the running time of the side on move.
  pub async fn time_consumed_now(&self) -> (u64, u64) {
    let state = self.state.lock().await;
    let (mut white, mut black) = (state.white_ms, state.black_ms);
    if state.finish.is_none() && state.players().is_some() {
      let running = state.last_move_at.elapsed().as_millis() as u64;
      match self.ctx.rules.side_to_move(&state.position) {
        Side::White => white += running,
        Side::Black => black += running,
      }
    }
    (white, black)
  }

  pub async fn view(&self) -> SessionView {
    let state = self.state.lock().await;
    let (white, black) = match &state.seats {
      Seats::Unpaired { first } => (first.clone(), None),
      Seats::Paired { white, black } => (white.clone(), Some(black.clone())),
    };
    let phase = match (&state.seats, state.finish) {
      (_, Some(finish)) => SessionPhase::Finished(finish.status),
      (Seats::Unpaired { .. }, None) => SessionPhase::PendingOpponent,
      (Seats::Paired { .. }, None) => SessionPhase::InProgress,
    };

    SessionView {
      id: self.id.clone(),
      phase,
      white,
      black,
      result: state.finish.map(|f| f.result),
      position: self.ctx.rules.snapshot(&state.position),
      moves: state.moves.clone(),
      started_at: state.started_at,
      white_time_consumed: state.white_ms,
      black_time_consumed: state.black_ms,
    }
  }

  #[cfg(test)]
  async fn armed_timers(&self) -> usize {
    let state = self.state.lock().await;
    [&state.timers.abandon, &state.timers.clock]
      .into_iter()
      .flatten()
      .filter(|h| !h.is_finished())
      .count()
  }
}
