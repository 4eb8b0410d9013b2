//! WebSocket front end: token check, per-connection pumps and dispatch into
//! the [`MatchCoordinator`].

use crate::{
  auth::{guest_identity, JwtAuth},
  coordinator::MatchCoordinator,
  protocol::{ClientMessage, Identity},
  rate_limit::{MessageLimits, RateLimiter},
  registry::Connection,
  rules::RulesEngine,
};
use axum::{
  extract::{
    ws::{Message, WebSocket},
    Query, WebSocketUpgrade,
  },
  http::{header::CONTENT_TYPE, Method, StatusCode},
  response::{IntoResponse, Response},
  routing::get,
  Router,
};
use futures::{SinkExt, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

struct Shared<R: RulesEngine> {
  auth: JwtAuth,
  coordinator: Arc<MatchCoordinator<R>>,
  limiter: RateLimiter,
  allow_guests: bool,
}

pub struct Server<R: RulesEngine> {
  auth: JwtAuth,
  coordinator: Arc<MatchCoordinator<R>>,
  limits: MessageLimits,
  allow_guests: bool,
}

impl<R: RulesEngine> Server<R> {
  pub fn new(coordinator: MatchCoordinator<R>) -> Self {
    Self {
      auth: JwtAuth::new("secret"),
      coordinator: Arc::new(coordinator),
      limits: MessageLimits::default(),
      allow_guests: true,
    }
  }

  pub fn with_auth(mut self, auth: JwtAuth) -> Self {
    self.auth = auth;
    self
  }

  pub fn with_limits(mut self, limits: MessageLimits) -> Self {
    self.limits = limits;
    self
  }

  /// Admit connections with an unverifiable token as generated guests.
  pub fn allow_guests(mut self, allow: bool) -> Self {
    self.allow_guests = allow;
    self
  }

  pub fn coordinator(&self) -> Arc<MatchCoordinator<R>> {
    self.coordinator.clone()
  }

  pub fn router(self) -> Router {
    let shared = Arc::new(Shared {
      auth: self.auth,
      coordinator: self.coordinator,
      limiter: RateLimiter::new(self.limits),
      allow_guests: self.allow_guests,
    });

    let cors = CorsLayer::new()
      .allow_methods([Method::GET])
      .allow_origin(Any)
      .allow_headers([CONTENT_TYPE]);

    Router::new()
      .route(
        "/ws",
        get(
          move |ws: WebSocketUpgrade, Query(params): Query<HashMap<String, String>>| {
            let shared = shared.clone();
            async move { upgrade(ws, params, shared) }
          },
        ),
      )
      .route("/healthz", get(|| async { "ok" }))
      .layer(cors)
      .layer(TraceLayer::new_for_http())
  }

  pub async fn listen(self, addr: &str) -> anyhow::Result<()> {
    let app = self.router();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("WebSocket server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
  }
}

/// Decide who a connection is from its `token` query parameter.
///
/// A missing token is always refused. An unverifiable one is admitted as a
/// fresh guest when `allow_guests` is set.
pub fn resolve_identity(
  auth: &JwtAuth,
  token: Option<&str>,
  allow_guests: bool,
) -> Result<Identity, StatusCode> {
  let Some(token) = token else {
    return Err(StatusCode::UNAUTHORIZED);
  };

  match auth.verify_identity(token) {
    Ok(claims) => Ok(claims.sub),
    Err(e) if allow_guests => {
      let guest = guest_identity();
      tracing::debug!("Token rejected ({:#}), admitting as {}", e, guest);
      Ok(guest)
    }
    Err(e) => {
      tracing::warn!("Token rejected: {:#}", e);
      Err(StatusCode::UNAUTHORIZED)
    }
  }
}

fn upgrade<R: RulesEngine>(
  ws: WebSocketUpgrade,
  params: HashMap<String, String>,
  shared: Arc<Shared<R>>,
) -> Response {
  let token = params.get("token").map(String::as_str);
  match resolve_identity(&shared.auth, token, shared.allow_guests) {
    Ok(identity) => ws.on_upgrade(move |socket| handle_ws(socket, identity, shared)),
    Err(status) => (status, "Unauthorized").into_response(),
  }
}

async fn handle_ws<R: RulesEngine>(ws: WebSocket, identity: Identity, shared: Arc<Shared<R>>) {
  let (mut sender_ws, mut receiver_ws) = ws.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<String>();

  let connection = Connection::new(identity.clone(), tx);
  shared.coordinator.connect(connection.clone()).await;

  // Pump queued frames out to the socket.
  let id = identity.clone();
  let mut sender_task = tokio::spawn(async move {
    while let Some(text) = rx.recv().await {
      if sender_ws.send(Message::Text(text.into())).await.is_err() {
        tracing::warn!("Failed to send message to {}", id);
        break;
      }
    }
  });

  let id = identity.clone();
  let reader = shared.clone();
  let mut receiver_task = tokio::spawn(async move {
    while let Some(Ok(msg)) = receiver_ws.next().await {
      match msg {
        Message::Text(text) => {
          if let Err(e) = reader.limiter.check(&id, text.len()).await {
            tracing::warn!("Dropped frame from {}: {}", id, e);
            continue;
          }
          match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(msg) => reader.coordinator.handle(&id, msg).await,
            Err(e) => tracing::warn!("Failed to parse message from {}: {}", id, e),
          }
        }
        Message::Close(_) => {
          tracing::info!("{} closed connection", id);
          break;
        }
        _ => {}
      }
    }
  });

  tokio::select! {
    _ = &mut receiver_task => sender_task.abort(),
    _ = &mut sender_task => receiver_task.abort(),
  }

  shared.coordinator.disconnect(&connection).await;
  shared.limiter.forget(&identity).await;
}
