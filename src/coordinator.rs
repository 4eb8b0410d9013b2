//! Routes protocol messages from connections to match sessions and owns
//! matchmaking.
//!
//! Pairing holds at most one waiting match process-wide. A pairing request
//! either fills that slot (when it belongs to someone else) or opens it. The
//! waiting session lives only in the slot; it enters the session map once a
//! second player is seated.

use crate::{
  config::MatchSettings,
  error::SessionError,
  protocol::{ClientMessage, Identity, MatchId, MatchResult, MoveRequest, PlayerRef, ServerMessage},
  registry::{Connection, ConnectionRegistry},
  rules::RulesEngine,
  session::{MatchSession, SessionContext, SessionMap},
  store::MatchStore,
};
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

const SELF_PAIRING_ALERT: &str = "Trying to Connect with yourself?";

pub struct MatchCoordinator<R: RulesEngine> {
  ctx: Arc<SessionContext<R>>,
  sessions: Arc<SessionMap<R>>,
  pending: Mutex<Option<Arc<MatchSession<R>>>>,
  users: RwLock<HashMap<Identity, Connection>>,
}

impl<R: RulesEngine> MatchCoordinator<R> {
  pub fn new(
    rules: R,
    store: Arc<dyn MatchStore>,
    registry: ConnectionRegistry,
    settings: MatchSettings,
  ) -> Self {
    let sessions: Arc<SessionMap<R>> = Arc::new(RwLock::new(HashMap::new()));
    let ctx = Arc::new(SessionContext::new(
      Arc::new(rules),
      store,
      registry,
      settings,
      &sessions,
    ));
    Self {
      ctx,
      sessions,
      pending: Mutex::new(None),
      users: RwLock::new(HashMap::new()),
    }
  }

  pub fn registry(&self) -> &ConnectionRegistry {
    &self.ctx.registry
  }

  /// Register a live connection. A newer connection for the same identity
  /// replaces the older one, including its seat in the room it was in.
  pub async fn connect(&self, connection: Connection) {
    let identity = connection.identity().to_string();
    let replaced = self
      .users
      .write()
      .await
      .insert(identity.clone(), connection.clone())
      .is_some();

    if replaced {
      tracing::debug!("{} reconnected, replacing previous connection", identity);
      if let Some(room_id) = self.ctx.registry.room_of(&identity).await {
        self.ctx.registry.join(connection, &room_id).await;
      }
    }
    tracing::info!("{} connected", identity);
  }

  /// Forget a closed connection. Matches it takes part in keep running; a
  /// match it was still waiting to be paired for is discarded.
  ///
  /// A connection that was already replaced by a newer one for the same
  /// identity is a no-op.
  pub async fn disconnect(&self, connection: &Connection) {
    let identity = connection.identity();
    {
      let mut users = self.users.write().await;
      match users.get(identity) {
        Some(current) if current.same_channel(connection) => {
          users.remove(identity);
        }
        _ => {
          tracing::debug!("Superseded connection of {} closed", identity);
          return;
        }
      }
    }
    self.ctx.registry.leave_connection(connection).await;

    let mut pending = self.pending.lock().await;
    if let Some(session) = pending.as_ref() {
      if session.pending_owner().await.as_deref() == Some(identity) {
        tracing::info!("Discarding waiting match {} of {}", session.id(), identity);
        *pending = None;
      }
    }
    drop(pending);

    tracing::info!("{} disconnected", identity);
  }

  pub async fn handle(&self, identity: &str, msg: ClientMessage) {
    match msg {
      ClientMessage::InitGame => self.request_pairing(identity).await,
      ClientMessage::Move { game_id, mv } => self.submit_move(identity, &game_id, &mv).await,
      ClientMessage::JoinRoom { game_id } => self.join_room(identity, &game_id).await,
      ClientMessage::ExitGame { game_id } => self.exit_game(identity, &game_id).await,
      ClientMessage::ChatSend { game_id, text } => self.relay_chat(identity, &game_id, &text).await,
    }
  }

  /// Live, paired session for `match_id`.
  pub async fn session(&self, match_id: &str) -> Option<Arc<MatchSession<R>>> {
    self.sessions.read().await.get(match_id).cloned()
  }

  /// Match id of the waiting slot, if any.
  pub async fn pending_match(&self) -> Option<MatchId> {
    self
      .pending
      .lock()
      .await
      .as_ref()
      .map(|session| session.id().to_string())
  }

  pub async fn active_matches(&self) -> usize {
    self.sessions.read().await.len()
  }

  async fn connection(&self, identity: &str) -> Option<Connection> {
    let connection = self.users.read().await.get(identity).cloned();
    if connection.is_none() {
      tracing::warn!("Message from unknown connection {}", identity);
    }
    connection
  }

  async fn request_pairing(&self, identity: &str) {
    let Some(connection) = self.connection(identity).await else {
      return;
    };

    let mut pending = self.pending.lock().await;
    if let Some(waiting) = pending.take() {
      if waiting.pending_owner().await.as_deref() == Some(identity) {
        *pending = Some(waiting);
        connection.send(&ServerMessage::alert(SELF_PAIRING_ALERT));
        return;
      }
      if let Err(waiting) = self.pair(waiting, identity, connection.clone()).await {
        *pending = Some(waiting);
      }
      return;
    }

    let match_id = Uuid::new_v4().to_string();
    let session = MatchSession::pending(self.ctx.clone(), match_id.clone(), identity.to_string());
    self.ctx.registry.join(connection.clone(), &match_id).await;
    *pending = Some(session);
    tracing::info!("{} is waiting for an opponent in {}", identity, match_id);

    connection.send(&ServerMessage::GameAdded { game_id: match_id });
  }

  /// Seat `identity` as the second player of `waiting`. On failure the
  /// session is handed back so the caller can restore the slot.
  async fn pair(
    &self,
    waiting: Arc<MatchSession<R>>,
    identity: &str,
    connection: Connection,
  ) -> Result<(), Arc<MatchSession<R>>> {
    let match_id = waiting.id().to_string();
    self.ctx.registry.join(connection.clone(), &match_id).await;
    self
      .sessions
      .write()
      .await
      .insert(match_id.clone(), waiting.clone());

    match waiting.start(identity).await {
      Ok(()) => Ok(()),
      Err(e) => {
        tracing::warn!("Could not start match {} for {}: {}", match_id, identity, e);
        self.sessions.write().await.remove(&match_id);
        self.ctx.registry.leave(identity).await;
        connection.send(&ServerMessage::alert("Could not start the game, please try again"));
        Err(waiting)
      }
    }
  }

  async fn submit_move(&self, identity: &str, match_id: &str, mv: &MoveRequest) {
    let Some(session) = self.session(match_id).await else {
      tracing::debug!("Move from {} for unknown match {}", identity, match_id);
      return;
    };

    match session.apply_move(identity, mv).await {
      Ok(applied) => {
        if applied.finished.is_some() {
          self.ctx.evict(match_id).await;
        }
      }
      Err(SessionError::Store(e)) => {
        tracing::warn!("Move by {} in {} not persisted: {}", identity, match_id, e)
      }
      Err(e) => tracing::debug!("Rejected move by {} in {}: {}", identity, match_id, e),
    }
  }

  async fn exit_game(&self, identity: &str, match_id: &str) {
    {
      let mut pending = self.pending.lock().await;
      if let Some(waiting) = pending.as_ref().filter(|s| s.id() == match_id) {
        if waiting.pending_owner().await.as_deref() == Some(identity) {
          *pending = None;
          self.ctx.registry.leave(identity).await;
          tracing::info!("{} withdrew waiting match {}", identity, match_id);
        }
        return;
      }
    }

    let Some(session) = self.session(match_id).await else {
      tracing::debug!("Exit from {} for unknown match {}", identity, match_id);
      return;
    };
    match session.exit(identity).await {
      Ok(()) => self.ctx.evict(match_id).await,
      Err(e) => tracing::debug!("Ignored exit by {} from {}: {}", identity, match_id, e),
    }
  }

  async fn join_room(&self, identity: &str, match_id: &str) {
    let Some(connection) = self.connection(identity).await else {
      return;
    };

    {
      let mut pending = self.pending.lock().await;
      if let Some(waiting) = pending.take_if(|s| s.id() == match_id) {
        if waiting.pending_owner().await.as_deref() == Some(identity) {
          *pending = Some(waiting);
          connection.send(&ServerMessage::alert(SELF_PAIRING_ALERT));
        } else if let Err(waiting) = self.pair(waiting, identity, connection).await {
          *pending = Some(waiting);
        }
        return;
      }
    }

    let session = match self.session(match_id).await {
      Some(session) => session,
      None => match self.resume(identity, match_id, &connection).await {
        Some(session) => session,
        None => return,
      },
    };

    self.ctx.registry.join(connection.clone(), match_id).await;
    let view = session.view().await;
    let (white_time, black_time) = session.time_consumed_now().await;
    let Some(black) = view.black else {
      return;
    };
    tracing::info!("{} joined match {}", identity, match_id);

    connection.send(&ServerMessage::GameJoined {
      game_id: view.id,
      moves: view.moves,
      white_player: PlayerRef::new(view.white),
      black_player: PlayerRef::new(black),
      player1_time_consumed: white_time,
      player2_time_consumed: black_time,
    });
  }

  /// Load a match that is not held in memory. Finished matches are answered
  /// directly and yield `None`; in-progress ones are rebuilt and registered.
  async fn resume(
    &self,
    identity: &str,
    match_id: &str,
    connection: &Connection,
  ) -> Option<Arc<MatchSession<R>>> {
    let record = match self.ctx.store.read_match(match_id).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        tracing::debug!("{} asked for unknown match {}", identity, match_id);
        connection.send(&ServerMessage::GameNotFound);
        return None;
      }
      Err(e) => {
        tracing::error!("Failed to load match {}: {}", match_id, e);
        connection.send(&ServerMessage::alert("Could not load the game"));
        return None;
      }
    };

    if record.status.is_terminal() {
      connection.send(&ServerMessage::GameEnded {
        result: record.result.unwrap_or(MatchResult::Draw),
        status: record.status,
        white_player: PlayerRef::new(record.white_player_id),
        black_player: PlayerRef::new(record.black_player_id),
        moves: record.moves,
        rating_changes: None,
      });
      return None;
    }

    let mut sessions = self.sessions.write().await;
    if let Some(existing) = sessions.get(match_id) {
      return Some(existing.clone());
    }
    match MatchSession::rehydrate(self.ctx.clone(), &record).await {
      Ok(session) => {
        sessions.insert(match_id.to_string(), session.clone());
        Some(session)
      }
      Err(e) => {
        tracing::error!("Failed to rebuild match {}: {}", match_id, e);
        connection.send(&ServerMessage::alert("Could not load the game"));
        None
      }
    }
  }

  async fn relay_chat(&self, identity: &str, match_id: &str, text: &str) {
    let text = text.trim();
    let max = self.ctx.settings.chat_max_chars;
    if text.is_empty() || text.chars().count() > max {
      tracing::debug!("Dropped chat from {}: empty or longer than {}", identity, max);
      return;
    }

    let known = self.session(match_id).await.is_some()
      || self.pending_match().await.as_deref() == Some(match_id);
    if !known {
      tracing::debug!("Chat from {} for unknown match {}", identity, match_id);
      return;
    }

    self
      .ctx
      .registry
      .broadcast(
        match_id,
        &ServerMessage::ChatMessage {
          game_id: match_id.to_string(),
          text: text.to_string(),
          ts: Utc::now().timestamp_millis(),
          from_user_id: identity.to_string(),
        },
      )
      .await;
  }
}
